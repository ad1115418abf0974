// src/error.rs
use log::error;
use serde::Serialize;
use std::convert::Infallible;
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;
use warp::{Rejection, Reply};

/// Errors surfaced by broker-facing operations.
///
/// `Clone` because in-flight fetches are shared futures.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("no broker credentials linked for user {0}")]
    MissingCredentials(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("broker returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("broker request failed: {0}")]
    Http(String),

    #[error("malformed broker payload: {0}")]
    MalformedPayload(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("live feed error: {0}")]
    Feed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl Reject for GatewayError {}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(err.to_string())
        } else if err.is_decode() {
            GatewayError::MalformedPayload(err.to_string())
        } else {
            GatewayError::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::MalformedPayload(err.to_string())
    }
}

impl From<scylla::transport::errors::QueryError> for GatewayError {
    fn from(err: scylla::transport::errors::QueryError) -> Self {
        GatewayError::Database(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::Feed(err.to_string())
    }
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingCredentials(_) => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream { .. }
            | GatewayError::Http(_)
            | GatewayError::MalformedPayload(_)
            | GatewayError::Feed(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Database(_) | GatewayError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            GatewayError::MissingCredentials(_) => "missing_credentials",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::Http(_) => "upstream_unreachable",
            GatewayError::MalformedPayload(_) => "malformed_payload",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::Database(_) => "database_error",
            GatewayError::Feed(_) => "feed_error",
            GatewayError::Config(_) => "config_error",
            GatewayError::BadRequest(_) => "bad_request",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

pub async fn handle_rejection(err: Rejection) -> std::result::Result<impl Reply, Infallible> {
    let (status, body) = if let Some(e) = err.find::<GatewayError>() {
        if e.status().is_server_error() {
            error!("Request failed: {}", e);
        }
        (
            e.status(),
            ErrorBody {
                code: e.code(),
                message: e.to_string(),
            },
        )
    } else if err.is_not_found() {
        (
            StatusCode::NOT_FOUND,
            ErrorBody {
                code: "not_found",
                message: "route not found".to_string(),
            },
        )
    } else if let Some(e) = err.find::<warp::reject::MissingHeader>() {
        (
            StatusCode::UNAUTHORIZED,
            ErrorBody {
                code: "unauthorized",
                message: e.to_string(),
            },
        )
    } else if let Some(e) = err.find::<warp::body::BodyDeserializeError>() {
        (
            StatusCode::BAD_REQUEST,
            ErrorBody {
                code: "bad_request",
                message: e.to_string(),
            },
        )
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (
            StatusCode::BAD_REQUEST,
            ErrorBody {
                code: "bad_request",
                message: e.to_string(),
            },
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            ErrorBody {
                code: "method_not_allowed",
                message: "method not allowed".to_string(),
            },
        )
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorBody {
                code: "internal",
                message: "internal server error".to_string(),
            },
        )
    };

    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_variants_to_status_codes() {
        assert_eq!(
            GatewayError::MissingCredentials("u1".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::Upstream {
                status: 500,
                body: "boom".into()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Timeout("quote".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[tokio::test]
    async fn rejection_renders_json_body() {
        let rejection = warp::reject::custom(GatewayError::BadRequest("page".into()));
        let reply = handle_rejection(rejection).await.unwrap().into_response();
        assert_eq!(reply.status(), StatusCode::BAD_REQUEST);
    }
}
