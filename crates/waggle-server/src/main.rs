use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use waggle_api::auth;
use waggle_api::conversations;
use waggle_api::middleware::require_auth;
use waggle_gateway::ChatState;
use waggle_gateway::collaborators::{InMemoryDirectory, LogModeration};
use waggle_gateway::connection;
use waggle_gateway::dispatcher::Dispatcher;
use waggle_gateway::fanout::{HttpNotifier, LogNotifier, NotificationSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "waggle=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("WAGGLE_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("WAGGLE_DB_PATH").unwrap_or_else(|_| "waggle.db".into());
    let host = std::env::var("WAGGLE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("WAGGLE_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    let db = waggle_db::Database::open(&PathBuf::from(&db_path))
        .map_err(|e| anyhow::anyhow!("failed to open database: {e}"))?;

    // Offline fanout target is chosen once at startup.
    let notifier: Arc<dyn NotificationSink> = match std::env::var("WAGGLE_NOTIFY_URL") {
        Ok(url) if !url.is_empty() => {
            info!("offline notifications -> {}", url);
            Arc::new(HttpNotifier::new(url))
        }
        _ => Arc::new(LogNotifier),
    };

    let state = ChatState {
        db: Arc::new(db),
        dispatcher: Dispatcher::new(),
        notifier,
        moderation: Arc::new(LogModeration),
        directory: Arc::new(InMemoryDirectory::default()),
        jwt_secret,
    };

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route(
            "/conversations/{thread_id}/messages",
            get(conversations::get_messages),
        )
        .route(
            "/conversations/{thread_id}/messages",
            post(conversations::send_message),
        )
        .route(
            "/conversations/{thread_id}/read",
            post(conversations::mark_read),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Waggle messaging server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(state): State<ChatState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state))
}
