//! HTTP server bootstrap for the provenance coordinator.
//!
//! This module wires together:
//! - configuration
//! - collaborators (in-memory or PostgreSQL, EVM contracts when configured)
//! - the coordinator and its reconciliation worker
//! - the Axum router

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use tokio::signal;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::api::handlers::{health_check, metrics, readiness_check};
use crate::auth::{
    auth_middleware, ApiKeyValidator, AuthMiddlewareState, Authenticator, RateLimiter,
    API_KEY_HEADER,
};
use crate::coordinator::{
    spawn_reconciliation_worker, Collaborators, Coordinator, CoordinatorConfig, Reconciler,
    ReconcilerMessage,
};
use crate::infra::{
    postgres, ChainConfig, DocumentStore, EvmRegistry, EvmTokenService, InMemoryAppendLog,
    InMemoryDocumentStore, InMemoryRegistry, InMemoryTokenService, PgAppendLog, PgDocumentStore,
    Registry, TokenService,
};
use crate::metrics::MetricsRegistry;
use crate::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

/// Where the audit log and document store live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Postgres,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Memory => "memory",
            Backend::Postgres => "postgres",
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub backend: Backend,
    /// Required for the postgres backend.
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub migrate_on_startup: bool,
    pub require_auth: bool,
    pub rate_limit_per_minute: Option<u32>,
    /// Run the background reconciliation worker
    pub reconcile_enabled: bool,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let listen_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address {host}:{port}: {e}"))?;

        let backend = match std::env::var("BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => Backend::Memory,
            "postgres" => Backend::Postgres,
            other => anyhow::bail!("Unknown BACKEND {other:?}; expected memory or postgres"),
        };

        let max_connections: u32 = std::env::var("MAX_DB_CONNECTIONS")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(10);

        let auth_mode = std::env::var("AUTH_MODE").unwrap_or_else(|_| "required".to_string());

        Ok(Self {
            listen_addr,
            backend,
            database_url: std::env::var("DATABASE_URL").ok(),
            max_connections,
            migrate_on_startup: env_flag("DB_MIGRATE_ON_STARTUP", true),
            require_auth: auth_mode != "disabled",
            rate_limit_per_minute: std::env::var("RATE_LIMIT_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| *v > 0),
            reconcile_enabled: env_flag("RECONCILE_ENABLED", true),
        })
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| {
            !matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "off"
            )
        })
        .unwrap_or(default)
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    /// `None` when reconciliation is disabled
    pub reconciler: Option<Reconciler>,
    pub store: Arc<dyn DocumentStore>,
    pub backend: &'static str,
}

impl AppState {
    pub fn new(coordinator: Coordinator, store: Arc<dyn DocumentStore>, backend: Backend) -> Self {
        Self {
            reconciler: Some(coordinator.reconciler.clone()),
            coordinator,
            store,
            backend: backend.as_str(),
        }
    }

    pub fn without_reconciler(mut self) -> Self {
        self.reconciler = None;
        self
    }
}

/// Start the HTTP server.
pub async fn run() -> anyhow::Result<()> {
    init_telemetry(&TelemetryConfig::from_env())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {e}"))?;

    info!("Starting TracerX coordinator v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env()?;
    info!("Configuration loaded");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Backend: {}", config.backend.as_str());

    let auth_state = auth_state(&config)?;
    let collaborators = build_collaborators(&config).await?;
    let store = collaborators.store.clone();

    let coordinator_config = CoordinatorConfig::from_env();
    info!("  Audit topic: {}", coordinator_config.recorder.topic);

    let coordinator = Coordinator::new(
        collaborators,
        coordinator_config,
        Arc::new(MetricsRegistry::new()),
    );

    let mut state = AppState::new(coordinator.clone(), store, config.backend);
    let worker = if config.reconcile_enabled {
        let (handle, control) = spawn_reconciliation_worker(coordinator.reconciler.clone());
        Some((handle, control))
    } else {
        info!("Reconciliation worker disabled (RECONCILE_ENABLED=0)");
        state = state.without_reconciler();
        None
    };

    let app = build_router(auth_state)?.with_state(state);

    info!("Starting HTTP server on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;

    info!("TracerX coordinator is ready to accept connections");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some((handle, control)) = worker {
        info!("Stopping reconciliation worker...");
        if control.send(ReconcilerMessage::Shutdown).await.is_err() {
            warn!("Reconciliation worker already stopped");
        }
        if let Err(e) = handle.await {
            error!(error = %e, "Reconciliation worker panicked");
        }
    }

    shutdown_telemetry();
    info!("Shutdown complete");

    Ok(())
}

/// API key authentication from the environment.
///
/// Refuses to start in required mode without any key configured.
pub fn auth_state(config: &ServerConfig) -> anyhow::Result<AuthMiddlewareState> {
    let api_key_validator = Arc::new(ApiKeyValidator::from_env());

    if config.require_auth && api_key_validator.is_empty() {
        anyhow::bail!(
            "AUTH_MODE=required but no API keys are configured; set REGULATOR_API_KEY or MANUFACTURER_API_KEYS (or set AUTH_MODE=disabled for local dev)"
        );
    }
    if !config.require_auth {
        warn!("AUTH_MODE=disabled: every request runs with regulator permissions");
    }
    info!("  API keys configured: {}", api_key_validator.len());

    Ok(AuthMiddlewareState {
        authenticator: Arc::new(Authenticator::new(api_key_validator)),
        require_auth: config.require_auth,
        rate_limiter: config
            .rate_limit_per_minute
            .map(|rpm| Arc::new(RateLimiter::new(rpm))),
    })
}

/// Registry and token service come from the chain when `HEDERA_RPC` and the
/// contract addresses are set; the log and store follow `BACKEND`.
pub async fn build_collaborators(config: &ServerConfig) -> anyhow::Result<Collaborators> {
    let (registry, tokens): (Arc<dyn Registry>, Arc<dyn TokenService>) =
        match ChainConfig::from_env() {
            Some(chain) => {
                info!("Chain access configured:");
                info!("  RPC URL: {}", chain.rpc_url);
                info!("  Registry: {:?}", chain.registry_address);
                info!("  Token: {:?}", chain.token_address);
                info!("  Chain ID: {}", chain.chain_id);
                (
                    Arc::new(EvmRegistry::new(chain.clone())),
                    Arc::new(EvmTokenService::new(chain)),
                )
            }
            None => {
                warn!(
                    "Chain access not configured (set HEDERA_RPC, REGISTRY_CONTRACT_ADDRESS, TOKEN_CONTRACT_ADDRESS, OPERATOR_PRIVATE_KEY); using in-memory registry and token service"
                );
                (
                    Arc::new(InMemoryRegistry::new()),
                    Arc::new(InMemoryTokenService::new()),
                )
            }
        };

    match config.backend {
        Backend::Memory => Ok(Collaborators {
            registry,
            tokens,
            log: Arc::new(InMemoryAppendLog::new()),
            store: Arc::new(InMemoryDocumentStore::new()),
        }),
        Backend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("BACKEND=postgres requires DATABASE_URL"))?;

            info!("Connecting to PostgreSQL...");
            let pool = postgres::connect(url, config.max_connections).await?;
            info!("Connected to PostgreSQL");

            if config.migrate_on_startup {
                info!("Running database migrations...");
                crate::migrations::run_postgres(&pool).await?;
                info!("Database migrations applied");
            } else {
                info!("DB migrations skipped (DB_MIGRATE_ON_STARTUP=0)");
            }

            Ok(Collaborators {
                registry,
                tokens,
                log: Arc::new(PgAppendLog::new(pool.clone())),
                store: Arc::new(PgDocumentStore::new(pool)),
            })
        }
    }
}

/// `/api` behind authentication, probes and metrics in the open.
pub fn build_router(auth_state: AuthMiddlewareState) -> anyhow::Result<Router<AppState>> {
    let api = crate::api::router().layer(axum::middleware::from_fn_with_state(
        auth_state,
        auth_middleware,
    ));

    let mut router = Router::new()
        .nest("/api", api)
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http());

    if let Some(cors_layer) = cors_layer_from_env()? {
        router = router.layer(cors_layer);
    }

    Ok(router)
}

fn cors_layer_from_env() -> anyhow::Result<Option<CorsLayer>> {
    let origins = match std::env::var("CORS_ALLOW_ORIGINS") {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };

    let origins = origins.trim();
    if origins.is_empty() {
        return Ok(None);
    }

    let allow_origin = if origins == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<HeaderValue>()
                    .map_err(|e| anyhow::anyhow!("Invalid CORS origin {s:?}: {e}"))
            })
            .collect::<anyhow::Result<_>>()?;
        AllowOrigin::list(origins)
    };

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
                HeaderName::from_static(API_KEY_HEADER),
            ]),
    ))
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
