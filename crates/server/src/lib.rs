//! HTTP host for the Tollgate gateway core.
//!
//! The core stays framework-free; this crate adapts it to axum. The
//! data plane is a single fallback handler that routes by listen-path
//! prefix and runs the matched spec's chain; the control plane is two
//! secret-guarded endpoints for health counters and spec reload.

pub mod control;
pub mod gateway;
