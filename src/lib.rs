//! Turnstile - In-Process Admission Control
//!
//! This crate implements fixed window, sliding window, leaky bucket and token
//! bucket rate limiters, each as a single shared limiter and as a per-key
//! limiter with idle-key eviction, plus axum middleware that applies a
//! limiter's decision to incoming HTTP requests.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
