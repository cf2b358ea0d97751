//! DCC (Direct Client-to-Client) transfer engine.
//!
//! Receives files offered via `DCC SEND`/`SSEND`, in active and passive
//! (reverse) mode, with resume, offset confirmation, TLS and a shared
//! throughput ceiling. Everything runs on one task; only checksum
//! verification is pushed to the blocking pool.

pub mod checksum;
pub mod error;
pub mod manager;
pub mod mux;
pub mod parser;
pub mod progress;
pub mod security;
pub mod session;
pub mod throttle;
pub mod transport;
