//! HTTP integration: rate limiting middleware and the demo server.

mod middleware;
mod server;

pub use middleware::{
    client_key, global_rate_limit, keyed_rate_limit, RateLimitRejection, RateLimitState,
};
pub use server::{ConfiguredLimiter, HttpServer};
