use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An insert hit the one-open-ticket-per-contact constraint.
    #[error("open ticket already exists for {phone} on {instance}")]
    Conflict { phone: String, instance: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("batch writer unavailable")]
    QueueClosed,
}

/// Failures of outbound calls to the gateway REST API, after retries.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("resource not found: {path}")]
    NotFound { path: String },

    #[error("invalid API key")]
    Unauthorized,

    #[error("gateway unavailable (status {status}), try again later")]
    Unavailable { status: u16 },

    #[error("gateway rejected request (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("gateway is not configured: {0}")]
    NotConfigured(&'static str),
}

impl GatewayError {
    pub fn from_status(status: u16, path: &str, body: String) -> Self {
        match status {
            404 => GatewayError::NotFound {
                path: path.to_string(),
            },
            401 => GatewayError::Unauthorized,
            s if s >= 500 => GatewayError::Unavailable { status: s },
            s => GatewayError::Rejected { status: s, body },
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Rejected { .. } | GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("unknown STORE_BACKEND {0:?} (expected postgres or memory)")]
    UnknownBackend(String),
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars): {0}")]
    Connect(#[source] sqlx::Error),

    #[error("failed to run sqlx migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("failed to build gateway client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("server runtime failure: {0}")]
    Serve(#[source] std::io::Error),
}

/// Error body for the agent-facing API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Gateway(err) => err.status_code(),
            ApiError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
