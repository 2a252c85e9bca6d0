use crate::api;
use crate::config::Config;
use crate::db::{self, ConnectionPool, ConnectionResult};
use crate::store;
use axum::extract::Request;
use axum::{Router, ServiceExt};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::signal::unix::SignalKind;
use tower::ServiceBuilder;
use tower_http::normalize_path::NormalizePathLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use utoipa_swagger_ui::SwaggerUi;

/// Element streaming can legitimately run for a very long time; requests are
/// only cut off after a day.
const REQUEST_DEADLINE: Duration = Duration::from_secs(86_400);

#[derive(Clone)]
pub struct AppState {
    pub connection_pool: ConnectionPool,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(connection_pool: ConnectionPool, config: Config) -> Self {
        AppState {
            connection_pool,
            config: Arc::new(config),
        }
    }

    pub fn get_connection(&self) -> ConnectionResult {
        self.connection_pool.get()
    }
}

/// Initializes logging using [`tracing_subscriber`].
pub fn enable_tracing(config: &Config) {
    let filter = match EnvFilter::try_new(&config.log_filter) {
        Ok(filter) => filter,
        Err(err) => {
            warn!("Log filter is invalid. Some or all directives may be ignored. Details:\n{err}");
            EnvFilter::new(&config.log_filter)
        }
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();
}

pub fn initialize(state: &AppState) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut conn = state.get_connection()?;
    db::run_migrations(&mut conn);
    store::version::initialize(&mut conn)?;
    store::annotation::migrate_database(&mut conn)?;
    Ok(())
}

pub async fn run(state: AppState) -> std::io::Result<()> {
    let port = state.config.port;
    let (router, api) = api::routes(state).split_for_parts();
    let router = router
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_DEADLINE));
    let normalized_router = ServiceBuilder::new()
        .layer(NormalizePathLayer::trim_trailing_slash())
        .service(router);
    let app = Router::new()
        .merge(SwaggerUi::new("/docs").url("/apidoc/openapi.json", api))
        .fallback_service(normalized_router);

    let address = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(address).await?;
    info!("Slidemark server running on {} threads", Handle::current().metrics().num_workers());
    debug!("listening on {}", listener.local_addr()?);
    axum::serve(listener, ServiceExt::<Request>::into_make_service(app))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Ctrl+C handler must be installable");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(SignalKind::terminate())
            .expect("Signal handler must be installable")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Stopping server...");
}
