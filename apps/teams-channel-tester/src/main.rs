use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use dotenvy::dotenv;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use teams_connector::{
    Activity, ConnectorClientProvider, ConnectorError, ConnectorSettings, Environment,
};

mod receiver;

use receiver::ActivityReceiver;

#[derive(Clone)]
struct AppState {
    provider: Arc<ConnectorClientProvider>,
    receiver: Arc<ActivityReceiver>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    // Process-wide logging is wired up exactly once, before any request is
    // served.
    init_tracing();

    let settings = ConnectorSettings::from_env().context("loading connector settings")?;
    let environment = Environment::from_env();
    let provider = Arc::new(
        ConnectorClientProvider::new(settings, environment)
            .context("building connector provider")?,
    );
    let receiver = Arc::new(ActivityReceiver::new(Arc::clone(&provider)));

    let state = AppState { provider, receiver };
    let app = Router::new()
        .route("/api/messages", post(post_message))
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("APP_PORT")
        .unwrap_or_else(|_| "3978".into())
        .parse()
        .unwrap_or(3978);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(?addr, ?environment, "teams channel tester listening");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}

/// Sink for one inbound activity from the messaging gateway.
async fn post_message(
    State(state): State<AppState>,
    Json(activity): Json<Activity>,
) -> Result<StatusCode, AppError> {
    let cancel = CancellationToken::new();
    state.receiver.process_activity(activity, &cancel).await?;
    Ok(StatusCode::OK)
}

/// Liveness/readiness probe: can we currently authenticate?
async fn healthz(State(state): State<AppState>) -> StatusCode {
    let cancel = CancellationToken::new();
    if state.provider.check_authentication(&cancel).await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

struct AppError(ConnectorError);

impl From<ConnectorError> for AppError {
    fn from(err: ConnectorError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ConnectorError::InvalidServiceUrl(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        };
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "teams_channel_tester=info,teams_connector=info,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
