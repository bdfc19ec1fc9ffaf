//! # Tollgate Core
//!
//! Core library for the Tollgate API gateway: a reverse proxy that
//! authenticates requests against per-key session state, enforces
//! rolling-window rate limits and quotas, applies per-API path policy,
//! and forwards surviving requests upstream.
//!
//! - **[`storage`]**: the key/value contract every stateful component
//!   goes through, with Redis, RPC-backed and in-memory
//!   implementations.
//! - **[`session`]**: the per-key identity record and its store.
//! - **[`limiter`]**: rolling-window rate admission plus quota
//!   accounting.
//! - **[`middleware`]**: the ordered per-request processor chain with
//!   first-failure short-circuit.
//! - **[`apispec`]**: API definitions, version data and path
//!   classification.
//! - **[`proxy`]**: the upstream forwarder.
//! - **[`health`]** / **[`events`]** / **[`analytics`]**: side-channel
//!   counters, the event bus and the analytics queue.
//! - **[`plugins`]**: the interface to the external script engine.
//! - **[`config`]**: the process-wide configuration snapshot.
//!
//! ## Request flow
//!
//! ```text
//! client
//!   │
//!   ▼
//! route by longest listen-path prefix ──► ApiSpec + its Chain
//!   │
//!   ▼
//! path guard ── ignored? ──────────────► proxy
//!   │
//! IP whitelist → authenticate (token | signed request)
//!   │
//! version check → key expiry → access rights → rate + quota
//!   │                                             │ declined
//!   ▼                                             ▼
//! transforms → proxy → upstream            {"error": …} + event
//! ```

pub mod analytics;
pub mod apispec;
pub mod config;
pub mod events;
pub mod health;
pub mod limiter;
pub mod middleware;
pub mod plugins;
pub mod proxy;
pub mod session;
pub mod storage;
