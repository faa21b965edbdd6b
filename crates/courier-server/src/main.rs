use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use courier_api::middleware::require_auth;
use courier_api::{AppState, AppStateInner, auth, conversations, devices, events};
use courier_core::registry::DeviceRegistry;
use courier_core::retention::run_retention_loop;
use courier_core::{CoreConfig, StorageMode};
use courier_gateway::connection;
use courier_gateway::dispatcher::Dispatcher;
use courier_types::events::ProtocolCommand;

#[derive(Clone)]
struct ServerState {
    dispatcher: Dispatcher,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("COURIER_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let data_dir = std::env::var("COURIER_DATA_DIR").unwrap_or_else(|_| "courier-data".into());
    let storage = match std::env::var("COURIER_STORAGE").as_deref() {
        Ok("sqlite") => StorageMode::Relational,
        _ => StorageMode::FileLog,
    };
    let retention_days: i64 = std::env::var("COURIER_RETENTION_DAYS")
        .unwrap_or_else(|_| "90".into())
        .parse()?;
    let retention_interval: u64 = std::env::var("COURIER_RETENTION_INTERVAL_SECS")
        .unwrap_or_else(|_| "3600".into())
        .parse()?;
    let host = std::env::var("COURIER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("COURIER_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let operator = std::env::var("COURIER_OPERATOR").unwrap_or_else(|_| "admin".into());
    let password_hash = operator_password_hash()?;

    // Commands for the protocol-client collaborator drain from here
    let (proto_tx, proto_rx) = mpsc::unbounded_channel();
    spawn_command_drain(proto_rx);

    // Device registry: revives persisted devices and their stores
    let core_config = CoreConfig {
        data_dir: PathBuf::from(&data_dir),
        retention_days,
        storage,
    };
    let registry = DeviceRegistry::open(core_config, proto_tx).await?;

    // Background retention pruning + compaction
    tokio::spawn(run_retention_loop(registry.clone(), retention_interval));

    // Shared state
    let dispatcher = Dispatcher::new(registry.panel_sender());
    let app_state: AppState = Arc::new(AppStateInner {
        registry,
        jwt_secret: jwt_secret.clone(),
        operator,
        password_hash,
    });

    let state = ServerState {
        dispatcher,
        jwt_secret,
    };

    // Routes
    let public_routes = Router::new()
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/devices", get(devices::list_devices))
        .route("/devices", post(devices::add_device))
        .route("/devices/{device_id}", delete(devices::delete_device))
        .route("/devices/{device_id}/events", post(events::deliver_event))
        .route(
            "/devices/{device_id}/conversations",
            get(conversations::list_conversations),
        )
        .route(
            "/devices/{device_id}/conversations/{conversation_id}/messages",
            get(conversations::get_messages),
        )
        .route(
            "/devices/{device_id}/conversations/{conversation_id}/messages",
            post(conversations::send_text),
        )
        .route(
            "/devices/{device_id}/conversations/{conversation_id}/media",
            post(conversations::send_media),
        )
        .route(
            "/devices/{device_id}/conversations/{conversation_id}/read",
            post(conversations::mark_read),
        )
        .route(
            "/devices/{device_id}/conversations/{conversation_id}/name",
            post(conversations::rename),
        )
        .route(
            "/devices/{device_id}/messages/search",
            get(conversations::search_messages),
        )
        .route(
            "/devices/{device_id}/cache/reset",
            post(conversations::reset_cache),
        )
        .route(
            "/devices/{device_id}/backfill",
            post(conversations::backfill_aliases),
        )
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state.clone());

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
    info!("Courier panel listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // drain every device's write queue before exiting
    app_state.registry.shutdown().await;

    Ok(())
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, state.jwt_secret)
    })
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

/// The protocol client attaches to this channel in deployment; commands
/// are logged either way so a misconfigured collaborator is visible.
fn spawn_command_drain(mut rx: mpsc::UnboundedReceiver<ProtocolCommand>) {
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            debug!("protocol command issued: {:?}", command);
        }
    });
}

/// Resolve the operator password: either a precomputed Argon2 hash, or a
/// plaintext dev password hashed at startup.
fn operator_password_hash() -> anyhow::Result<String> {
    use argon2::password_hash::{PasswordHasher, SaltString, rand_core::OsRng};

    if let Ok(hash) = std::env::var("COURIER_PASSWORD_HASH") {
        return Ok(hash);
    }
    let password =
        std::env::var("COURIER_PASSWORD").unwrap_or_else(|_| "dev-password-change-me".into());
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2::Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hash failed: {}", e))?
        .to_string();
    Ok(hash)
}
