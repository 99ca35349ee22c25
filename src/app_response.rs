use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeError;

use crate::error::CompanionError;

/// JSON envelope handed across the C ABI.
#[derive(Debug, Serialize, Deserialize)]
pub enum AppResponse {
    DatabaseError(String),
    StorageUnavailable(String),
    QuotaExceeded(String),
    NetworkError(String),
    SerializationError(String),
    NotFound(String),
    ValidationError(String),
    BadRequest(String),
    Ok(String),
}

impl Display for AppResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AppResponse::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            AppResponse::StorageUnavailable(msg) => write!(f, "Storage unavailable: {}", msg),
            AppResponse::QuotaExceeded(msg) => write!(f, "Quota exceeded: {}", msg),
            AppResponse::NetworkError(msg) => write!(f, "Network error: {}", msg),
            AppResponse::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            AppResponse::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppResponse::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppResponse::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            AppResponse::Ok(msg) => write!(f, "Ok: {}", msg),
        }
    }
}

impl From<CompanionError> for AppResponse {
    fn from(err: CompanionError) -> Self {
        let msg = err.to_string();
        match err {
            CompanionError::StorageUnavailable(_) => AppResponse::StorageUnavailable(msg),
            CompanionError::QuotaExceeded(_) => AppResponse::QuotaExceeded(msg),
            CompanionError::NotFound(_) | CompanionError::UpstreamNotFound(_) => {
                AppResponse::NotFound(msg)
            }
            CompanionError::Transport(_)
            | CompanionError::Offline(_)
            | CompanionError::Upstream { .. } => AppResponse::NetworkError(msg),
            CompanionError::Serialization(_) => AppResponse::SerializationError(msg),
            CompanionError::Validation(_) => AppResponse::ValidationError(msg),
            CompanionError::Database(_) | CompanionError::Io(_) => AppResponse::DatabaseError(msg),
        }
    }
}

impl From<SerdeError> for AppResponse {
    fn from(err: SerdeError) -> Self {
        AppResponse::SerializationError(format!("JSON serialization error: {}", err))
    }
}

impl AppResponse {
    pub fn success(msg: impl Into<String>) -> Self {
        AppResponse::Ok(msg.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, AppResponse::Ok(_))
    }
}
