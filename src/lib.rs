//! Library surface for the OKX repeater, split out from `main.rs` so
//! integration tests can drive the upstream → filter → broadcast chain
//! without spawning the real binary.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod metrics;
pub mod session;
pub mod upstream;
