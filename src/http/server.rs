//! HTTP server wiring a configured limiter in front of the routes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{middleware::from_fn_with_state, routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{global_rate_limit, keyed_rate_limit, RateLimitState};
use crate::config::{Algorithm, RateLimitingConfig, Scope};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    spawn_sweeper, ExpiringFixedWindowLimiter, FixedWindowLimiter, IpRateLimiter,
    KeyedFixedWindowLimiter, KeyedLeakyBucketLimiter, KeyedLimiter, KeyedSlidingWindowLimiter,
    LeakyBucketLimiter, Limiter, SlidingWindowLimiter, Sweep, SweeperHandle, TokenBucket,
};

/// The limiter selected by configuration.
pub enum ConfiguredLimiter {
    /// One decision for the whole process
    Global(Arc<dyn Limiter>),
    /// One decision per client, with idle state swept in the background
    PerClient {
        limiter: Arc<dyn KeyedLimiter>,
        sweeper: Arc<dyn Sweep>,
        sweep_period: std::time::Duration,
    },
}

impl ConfiguredLimiter {
    /// Build the limiter described by `config`.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        config.validate()?;

        let window = config.window();
        let limiter = match config.scope {
            Scope::Global => {
                let limiter: Arc<dyn Limiter> = match config.algorithm {
                    Algorithm::FixedWindow => Arc::new(FixedWindowLimiter::new(config.limit, window)?),
                    Algorithm::SlidingWindow => {
                        Arc::new(SlidingWindowLimiter::new(config.limit, window)?)
                    }
                    Algorithm::LeakyBucket => {
                        Arc::new(LeakyBucketLimiter::new(config.rate, config.capacity)?)
                    }
                    Algorithm::TokenBucket => Arc::new(TokenBucket::new(config.rate, config.capacity)?),
                    Algorithm::ExpiringFixedWindow => {
                        return Err(TurnstileError::Config(
                            "expiring_fixed_window only supports the per_client scope".into(),
                        ))
                    }
                };
                ConfiguredLimiter::Global(limiter)
            }
            Scope::PerClient => match config.algorithm {
                Algorithm::FixedWindow => {
                    Self::per_client(KeyedFixedWindowLimiter::new(config.limit, window)?, config)
                }
                Algorithm::SlidingWindow => {
                    Self::per_client(KeyedSlidingWindowLimiter::new(config.limit, window)?, config)
                }
                Algorithm::LeakyBucket => Self::per_client(
                    KeyedLeakyBucketLimiter::new(config.rate, config.capacity)?,
                    config,
                ),
                Algorithm::TokenBucket => Self::per_client(
                    IpRateLimiter::new(config.rate, config.capacity, config.cleanup_interval())?,
                    config,
                ),
                Algorithm::ExpiringFixedWindow => Self::per_client(
                    ExpiringFixedWindowLimiter::new(config.limit, window, config.retry_after)?,
                    config,
                ),
            },
        };

        info!(
            algorithm = ?config.algorithm,
            scope = ?config.scope,
            "Rate limiter initialized"
        );
        Ok(limiter)
    }

    fn per_client<L>(limiter: L, config: &RateLimitingConfig) -> Self
    where
        L: KeyedLimiter + Sweep + 'static,
    {
        let limiter = Arc::new(limiter);
        ConfiguredLimiter::PerClient {
            limiter: limiter.clone(),
            sweeper: limiter,
            sweep_period: config.cleanup_interval(),
        }
    }
}

/// HTTP server fronted by the rate limiting middleware.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    limiter: ConfiguredLimiter,
    exempt_paths: Vec<String>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, limiter: ConfiguredLimiter, exempt_paths: Vec<String>) -> Self {
        Self {
            addr,
            limiter,
            exempt_paths,
        }
    }

    /// The application routes with the rate limiting layer applied.
    pub fn router(&self) -> Router {
        let routes = Router::new()
            .route("/", get(index))
            .route("/healthz", get(healthz));

        match &self.limiter {
            ConfiguredLimiter::Global(limiter) => {
                let state = RateLimitState::new(Arc::clone(limiter))
                    .with_exempt_paths(self.exempt_paths.iter().cloned());
                routes.layer(from_fn_with_state(state, global_rate_limit::<dyn Limiter>))
            }
            ConfiguredLimiter::PerClient { limiter, .. } => {
                let state = RateLimitState::new(Arc::clone(limiter))
                    .with_exempt_paths(self.exempt_paths.iter().cloned());
                routes.layer(from_fn_with_state(state, keyed_rate_limit::<dyn KeyedLimiter>))
            }
        }
    }

    /// Start the idle-key sweeper, if the limiter keeps per-client state.
    fn start_sweeper(&self) -> Option<SweeperHandle> {
        match &self.limiter {
            ConfiguredLimiter::Global(_) => None,
            ConfiguredLimiter::PerClient {
                sweeper,
                sweep_period,
                ..
            } => Some(spawn_sweeper(Arc::clone(sweeper), *sweep_period)),
        }
    }

    /// Serve until `signal` resolves, then stop the sweeper.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let router = self.router();
        let sweeper = self.start_sweeper();

        info!(
            addr = %self.addr,
            "Starting HTTP server with graceful shutdown"
        );

        let served = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Server(e.to_string())
        });

        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }
        served
    }
}

async fn index() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn healthz() -> &'static str {
    "ok"
}
