//! Speaking-turn coordination server library.
//!
//! Implements a meeting "speaking turn" protocol over WebSocket: the first
//! connector becomes the meeting master, the master opens a randomized-delay
//! traffic-light gate ("semaphore"), participants race to press a button
//! while the gate is open, and the server sequences them one at a time as
//! the current speaker. Every connection observes the same session state.

// shared library
pub mod common;

// server
pub mod server;
