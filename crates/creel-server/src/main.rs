use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Extension, Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use creel_api::middleware::{Identity, require_identity};
use creel_api::{AppState, AppStateInner, messages};
use creel_engine::ThreadEngine;
use creel_realtime::{Dispatcher, connection};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "creel=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let db_path = std::env::var("CREEL_DB_PATH").unwrap_or_else(|_| "creel.db".into());
    let host = std::env::var("CREEL_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("CREEL_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init the message store
    let db = Arc::new(creel_store::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let dispatcher = Dispatcher::new();
    let engine = Arc::new(ThreadEngine::new(db, dispatcher.sender()));
    let state: AppState = Arc::new(AppStateInner {
        engine,
        dispatcher: dispatcher.clone(),
    });

    let api_routes = Router::new()
        .route("/{namespace}/conversations", get(messages::list_conversations))
        .route("/{namespace}/threads/{thread_root}", get(messages::get_thread))
        .route("/{namespace}/messages", post(messages::send_message))
        .route("/{namespace}/unread-count", get(messages::unread_count))
        .route("/messages/{message_id}/read", post(messages::mark_read))
        .route("/messages/{message_id}/archived", post(messages::set_archived))
        .route("/threads/{thread_root}", delete(messages::delete_thread))
        .route("/gateway", get(ws_upgrade))
        .layer(middleware::from_fn(require_identity))
        .with_state(state);

    let app = Router::new()
        .merge(api_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("creel messaging server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Extension(Identity(account)): Extension<Identity>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let dispatcher = state.dispatcher.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, dispatcher, account))
}
