//! sentinel_gateway
//!
//! HTTP surface of the compliance agent:
//! - POST /analyze                 full decision pipeline, signed response
//! - GET  /api/v1/status/{agent}   signed read: both reputation tracks + head
//! - GET  /api/v1/rep/{agent}      float score
//! - GET  /audit/verify /audit/head
//! - GET  /health /metrics /stats  unauthenticated operational surface
//! - POST /api/v2/register, GET /api/v2/agent/{id}, POST /api/v2/revoke
//!
//! All durable state sits behind the KV store and the audit/ledger files;
//! the only process-local state is the rate-limit window and the counters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::info;

use sentinel_audit::AuditChain;
use sentinel_kv::{KvStore, ReplayGuard};
use sentinel_reputation::{ReputationLedger, ScoreOracle};

mod config;
mod error;
mod identity;
mod metrics;
mod ratelimit;
mod routes;

pub use config::{ConfigError, GatewayConfig};
pub use error::ApiError;
pub use identity::{AgentRecord, IdentityRegistry};
pub use metrics::Metrics;
pub use ratelimit::RateLimiter;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("audit error: {0}")]
    Audit(#[from] sentinel_audit::AuditError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<GatewayConfig>,
    pub kv: Arc<dyn KvStore>,
    pub audit: Arc<AuditChain>,
    pub ledger: Arc<ReputationLedger>,
    pub oracle: Arc<ScoreOracle>,
    pub replay: Arc<ReplayGuard>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
    pub identity: Arc<IdentityRegistry>,
    pub started: Instant,
}

impl AppState {
    /// Wire the full state. Fails fast in strict mode when secrets are
    /// missing.
    pub fn new(cfg: GatewayConfig, kv: Arc<dyn KvStore>) -> Result<Self, GatewayError> {
        cfg.validate()?;

        let audit_secret = if cfg.audit_secret.is_empty() {
            None
        } else {
            Some(cfg.audit_secret.clone())
        };
        let audit = Arc::new(AuditChain::open(cfg.data_dir.join("audit"), audit_secret)?);
        let ledger = Arc::new(ReputationLedger::new(
            cfg.data_dir.join("reputation.json"),
            cfg.decay,
        ));
        let oracle = Arc::new(ScoreOracle::new(kv.clone()));
        let replay = Arc::new(ReplayGuard::new(
            kv.clone(),
            cfg.data_dir.join("replay_nonces.json"),
        ));
        let limiter = Arc::new(RateLimiter::new(
            cfg.rate_limit_max,
            Duration::from_secs(cfg.rate_limit_window_sec),
        ));

        Ok(Self {
            cfg: Arc::new(cfg),
            identity: Arc::new(IdentityRegistry::new(kv.clone())),
            kv,
            audit,
            ledger,
            oracle,
            replay,
            limiter,
            metrics: Arc::new(Metrics::new()),
            started: Instant::now(),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/analyze", post(routes::analyze))
        .route("/api/v1/status/:agent_id", get(routes::status))
        .route("/api/v1/rep/:agent_id", get(routes::rep))
        .route("/audit/verify", get(routes::audit_verify))
        .route("/audit/head", get(routes::audit_head))
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::metrics))
        .route("/stats", get(routes::stats))
        .route("/api/v2/register", post(routes::register_agent))
        .route("/api/v2/agent/:agent_id", get(routes::get_agent))
        .route("/api/v2/revoke", post(routes::revoke_agent))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState) -> Result<(), GatewayError> {
    let addr = state.cfg.bind_addr.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
