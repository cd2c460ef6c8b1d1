//! Modelgate - a local reverse proxy that runs inference backends on demand
//!
//! This library provides a proxy that:
//! - Routes OpenAI-style `/v1/...` requests by the `model` field of their body
//! - Spawns the matching backend process on first use, on a freshly allocated port
//! - Keeps at most one non-persistent backend running, swapping on demand
//! - Gates traffic on a backend's health endpoint
//! - Relays server-sent-event and chunked responses as they arrive
//! - Stops backends gracefully (SIGTERM, then SIGKILL after a timeout)

pub mod admin;
pub mod config;
pub mod error;
pub mod pool;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod resolver;
