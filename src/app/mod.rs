//! Application Layer
//!
//! This module contains:
//! - Tunnel: flow dispatcher (stack → handler tasks → dialer)
//! - Handlers: per-flow TCP surrogate and UDP relay logic
//! - Runtime: configuration-driven wiring, lifecycle and reload
//! - StatsApi: Prometheus metrics over HTTP

mod dispatcher;
mod handler;
pub mod metrics;
mod runtime;
pub mod stats_api;

pub use dispatcher::{DispatchState, Tunnel};
pub use runtime::{build_dialer, parse_listen_address, Engine, Runtime};
