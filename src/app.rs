use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::{Config, StoreBackend};
use crate::dispatch::Dispatcher;
use crate::error::{ApiError, StartupError, StoreError};
use crate::gateway::{sent_message_id, EvolutionClient, MediaMessage};
use crate::persist::{BatchQueue, Persister};
use crate::routing::{AgentReply, TicketRouter};
use crate::store::{MemoryStore, PgStore, TicketStore};
use crate::types::{
    CreateInstanceBody, DispatchOutcome, MessageType, ReplyBody, WebhookAck, WebhookEnvelope,
};

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Everything a handler needs, built once at startup.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn TicketStore>,
    pub router: Arc<TicketRouter>,
    pub dispatcher: Dispatcher,
    pub gateway: EvolutionClient,
}

impl AppState {
    /// Must run inside the tokio runtime when batching is enabled.
    pub fn new(config: Config, store: Arc<dyn TicketStore>) -> Result<Arc<Self>, StartupError> {
        let persister = if config.batching.enabled {
            info!(
                size = config.batching.size,
                flush_ms = config.batching.flush_interval.as_millis() as u64,
                "message batching enabled"
            );
            Persister::Batched(BatchQueue::spawn(
                store.clone(),
                config.batching.size,
                config.batching.flush_interval,
            ))
        } else {
            Persister::Direct(store.clone())
        };
        let router = Arc::new(TicketRouter::new(store.clone(), persister));
        let dispatcher = Dispatcher::new(router.clone(), store.clone());
        let gateway = EvolutionClient::new(&config.gateway).map_err(StartupError::HttpClient)?;
        if config.gateway.base_url.is_none() {
            warn!("EVOLUTION_API_URL is not set; agent-facing gateway calls will fail");
        }
        Ok(Arc::new(Self {
            config,
            store,
            router,
            dispatcher,
            gateway,
        }))
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn receive_webhook(state: &AppState, body: &[u8], path_event: Option<String>) -> WebhookAck {
    let mut envelope = match serde_json::from_slice::<WebhookEnvelope>(body) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, size = body.len(), "invalid webhook payload");
            return WebhookAck {
                received: true,
                timestamp: now_iso(),
                event: path_event.unwrap_or_default(),
                instance: String::new(),
                outcome: DispatchOutcome::skipped("invalid webhook payload"),
            };
        }
    };
    if envelope.event.trim().is_empty() {
        if let Some(event) = path_event {
            envelope.event = event;
        }
    }

    let outcome = state.dispatcher.dispatch(&envelope).await;
    WebhookAck {
        received: true,
        timestamp: now_iso(),
        event: envelope.event,
        instance: envelope.instance,
        outcome,
    }
}

async fn evolution_webhook(State(state): State<Arc<AppState>>, body: Bytes) -> Json<WebhookAck> {
    Json(receive_webhook(&state, &body, None).await)
}

async fn evolution_webhook_by_event(
    Path(event): Path<String>,
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Json<WebhookAck> {
    Json(receive_webhook(&state, &body, Some(event)).await)
}

fn media_type_from(media_type: Option<&str>, mimetype: Option<&str>) -> MessageType {
    let kind = media_type
        .map(str::to_ascii_lowercase)
        .or_else(|| {
            mimetype
                .and_then(|m| m.split('/').next())
                .map(str::to_ascii_lowercase)
        })
        .unwrap_or_default();
    match kind.as_str() {
        "image" => MessageType::Image,
        "video" => MessageType::Video,
        "audio" => MessageType::Audio,
        _ => MessageType::Document,
    }
}

async fn reply_to_ticket(
    Path(ticket_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReplyBody>,
) -> Result<Json<Value>, ApiError> {
    let text = body.text.trim();
    let media_url = body
        .media_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty());
    if text.is_empty() && media_url.is_none() {
        return Err(ApiError::BadRequest("text or mediaUrl is required".to_string()));
    }
    let ticket = state
        .store
        .get_ticket(&ticket_id)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            entity: "ticket",
            id: ticket_id.clone(),
        })?;
    let (Some(phone), Some(instance)) = (ticket.client_phone(), ticket.instance_name()) else {
        return Err(ApiError::BadRequest(
            "ticket has no WhatsApp contact".to_string(),
        ));
    };

    let (sent, message_type, content) = match media_url {
        Some(url) => {
            let message_type = media_type_from(body.media_type.as_deref(), body.mimetype.as_deref());
            let media = MediaMessage {
                mediatype: message_type.as_str().to_string(),
                media: url.to_string(),
                mimetype: body.mimetype.clone(),
                caption: (!text.is_empty()).then(|| text.to_string()),
                file_name: body.file_name.clone(),
            };
            let sent = state.gateway.send_media(instance, phone, &media).await?;
            let content = if text.is_empty() {
                body.file_name
                    .clone()
                    .unwrap_or_else(|| format!("[{}]", message_type.as_str()))
            } else {
                text.to_string()
            };
            (sent, message_type, content)
        }
        None => {
            let sent = state.gateway.send_text(instance, phone, text).await?;
            (sent, MessageType::Text, text.to_string())
        }
    };
    let gateway_message_id = sent_message_id(&sent);

    let message_id = state
        .router
        .record_agent_reply(AgentReply {
            ticket_id: &ticket.id,
            content,
            message_type,
            agent_name: body.agent_name.as_deref().unwrap_or("Agent"),
            agent_id: body.agent_id.clone(),
            media_url,
            gateway_message_id,
            instance,
        })
        .await?;
    info!(ticket_id = %ticket.id, message_id = %message_id, instance = %instance, message_type = message_type.as_str(), "agent reply sent");

    Ok(Json(json!({
        "ok": true,
        "messageId": message_id,
        "gatewayMessageId": gateway_message_id,
    })))
}

async fn create_instance(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateInstanceBody>,
) -> Result<Json<Value>, ApiError> {
    let name = body.instance_name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("instanceName is required".to_string()));
    }
    let created = state
        .gateway
        .create_instance(name, body.number.as_deref())
        .await?;
    info!(instance = %name, "gateway instance created");
    Ok(Json(created))
}

async fn instance_qrcode(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.gateway.connect_instance(&name).await?))
}

async fn instance_state(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.gateway.connection_state(&name).await?))
}

async fn logout_instance(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let response = state.gateway.logout_instance(&name).await?;
    info!(instance = %name, "gateway instance logged out");
    Ok(Json(response))
}

async fn delete_instance(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let response = state.gateway.delete_instance(&name).await?;
    info!(instance = %name, "gateway instance deleted");
    Ok(Json(response))
}

async fn set_instance_webhook(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let url = format!("{}/webhook/evolution", state.config.public_base_url);
    let response = state.gateway.set_webhook(&name, &url).await?;
    info!(instance = %name, url = %url, "gateway webhook configured");
    Ok(Json(response))
}

async fn get_instance_webhook(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.gateway.find_webhook(&name).await?))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        // Deliveries may inline base64 media of any size.
        .route(
            "/webhook/evolution",
            post(evolution_webhook).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/webhook/evolution/{event}",
            post(evolution_webhook_by_event).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/tickets/{ticket_id}/reply", post(reply_to_ticket))
        .route("/api/instances", post(create_instance))
        .route("/api/instances/{name}", delete(delete_instance))
        .route("/api/instances/{name}/qrcode", get(instance_qrcode))
        .route("/api/instances/{name}/state", get(instance_state))
        .route("/api/instances/{name}/logout", post(logout_instance))
        .route(
            "/api/instances/{name}/webhook",
            get(get_instance_webhook).post(set_instance_webhook),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ticket_router=info,tower_http=info,warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn open_store(config: &Config) -> Result<Arc<dyn TicketStore>, StartupError> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let db = PgPoolOptions::new()
                .max_connections(10)
                .connect(&config.database_url)
                .await
                .map_err(StartupError::Connect)?;
            sqlx::migrate!("./migrations").run(&db).await?;
            Ok(Arc::new(PgStore::new(db)))
        }
        StoreBackend::Memory => {
            warn!("STORE_BACKEND=memory: tickets and messages are lost on restart");
            Ok(Arc::new(MemoryStore::with_open_ticket_constraint()))
        }
    }
}

pub async fn run() -> Result<(), StartupError> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env()?;
    let port = config.port;
    let store = open_store(&config).await?;
    let state = AppState::new(config, store)?;
    let app = build_router(state.clone());

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.clone(),
            source,
        })?;

    info!("ticket router running at http://localhost:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(StartupError::Serve)?;

    state.router.close().await;
    Ok(())
}
