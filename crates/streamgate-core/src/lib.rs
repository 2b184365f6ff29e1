//! Core library for the Streamgate SSE token-streaming gateway.
//!
//! Streamgate streams LLM tokens to many concurrent HTTP clients over
//! Server-Sent Events. Instances behind a load balancer coordinate
//! through a shared Redis store so per-user and global limits, circuit
//! state, and the response cache are consistent fleet-wide.
//!
//! The request path: admission gate → pool coordinator → lifecycle
//! pipeline → {cache | provider behind a circuit breaker} → SSE frames.
//! On pool exhaustion, a request can fail over through a shared job
//! stream to a worker on any instance, with results bridged back over
//! pub/sub.

pub mod admission;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod limiter;
pub mod pipeline;
pub mod pool;
pub mod providers;
pub mod queue;
pub mod request;
pub mod store;
pub mod tracker;
pub mod validate;
