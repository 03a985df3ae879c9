use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Error taxonomy the core surfaces. Every provider/cache operation that can
/// fail funnels into one of these so callers (scheduler, webdav adapter,
/// qbittorrent facade) can react without string-matching.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("torrent not found: {0}")]
    TorrentNotFound(String),

    #[error("hoster unavailable")]
    HosterUnavailable,

    #[error("traffic exceeded")]
    TrafficExceeded,

    #[error("provider transient error: {0}")]
    ProviderTransient(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("persistence error: {0}")]
    PersistenceError(#[from] std::io::Error),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// True for errors that a retry loop should back off and try again for,
    /// rather than giving up immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::TrafficExceeded | CoreError::ProviderTransient(_))
    }
}

/// Manual `Clone`: the source errors behind `Request`/`PersistenceError`/
/// `Other` aren't themselves `Clone`, so those variants collapse to their
/// message text. Needed so single-flighted results (download links,
/// reinserts) can hand every waiter its own owned error.
impl Clone for CoreError {
    fn clone(&self) -> Self {
        match self {
            CoreError::TorrentNotFound(id) => CoreError::TorrentNotFound(id.clone()),
            CoreError::HosterUnavailable => CoreError::HosterUnavailable,
            CoreError::TrafficExceeded => CoreError::TrafficExceeded,
            CoreError::ProviderTransient(msg) => CoreError::ProviderTransient(msg.clone()),
            CoreError::ConfigInvalid(msg) => CoreError::ConfigInvalid(msg.clone()),
            CoreError::PersistenceError(e) => CoreError::ProviderTransient(e.to_string()),
            CoreError::Request(e) => CoreError::ProviderTransient(e.to_string()),
            CoreError::Other(e) => CoreError::ProviderTransient(e.to_string()),
        }
    }
}

/// Wraps `anyhow::Error` for axum handlers, in the same shape used throughout
/// the qbittorrent facade and webdav adapter.
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<CoreError>() {
            Some(CoreError::TorrentNotFound(_)) => StatusCode::NOT_FOUND,
            Some(CoreError::HosterUnavailable) => StatusCode::PRECONDITION_FAILED,
            Some(CoreError::TrafficExceeded) => StatusCode::TOO_MANY_REQUESTS,
            Some(CoreError::ConfigInvalid(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status,
            Json(json!({
                "error_message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
