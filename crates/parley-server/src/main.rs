use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router, middleware,
    extract::State,
    response::IntoResponse,
    routing::{get, patch},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_api::middleware::require_auth;
use parley_api::{AppState, AppStateInner, messages, presence};
use parley_gateway::auth::TokenAccess;
use parley_gateway::hub::Hub;
use parley_gateway::session::{self, GatewayState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("PARLEY_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("PARLEY_DB_PATH").unwrap_or_else(|_| "parley.db".into());
    let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PARLEY_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Shared state
    let store = Arc::new(parley_store::Database::open(&PathBuf::from(&db_path))?);
    let hub = Hub::new();
    let access = Arc::new(TokenAccess::new(store.clone(), &jwt_secret));

    let app_state: AppState = Arc::new(AppStateInner {
        store: store.clone(),
        hub: hub.clone(),
    });
    let gateway = GatewayState {
        hub,
        store,
        access,
    };

    // Routes
    let protected_routes = Router::new()
        .route("/groups/{group_id}/messages", get(messages::history))
        .route("/groups/{group_id}/messages/search", get(messages::search))
        .route(
            "/groups/{group_id}/messages/{message_id}",
            patch(messages::edit_message).delete(messages::delete_message),
        )
        .route("/groups/{group_id}/online", get(presence::online_users))
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state.clone());

    let ws_route = Router::new()
        .route("/ws/{group_id}", get(session::ws_connect))
        .with_state(gateway);

    let app = Router::new()
        .route("/health", get(health))
        .with_state(app_state)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("parley listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping() {
        Ok(()) => Json(serde_json::json!({
            "status": "healthy",
            "database": "connected",
        })),
        Err(e) => Json(serde_json::json!({
            "status": "unhealthy",
            "database": "disconnected",
            "error": e.to_string(),
        })),
    }
}
