//! Error taxonomy for everything the gateway hands back to callers.
//!
//! The outer HTTP status, the JSON error body, and the audit status label
//! all derive from one place so the three can never drift apart.

use std::borrow::Cow;

use axum::response::{IntoResponse, Response};
use axum::Json;
use derive_more::{Display, Error, From};
use http::StatusCode;
use serde::Serialize;
use tokio::task::JoinError;
use tracing::{debug, error, trace, warn};

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Outcome label attached to profiles and metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum QueryStatus {
    /// accepted, every result is a plain result
    Success,
    /// accepted, but at least one result carries a JSON-RPC error
    Fail,
    /// accepted, but the deadline fired first
    Timeout,
    /// refused before any upstream was touched
    Reject,
    /// the gateway itself broke
    Error,
}

impl Default for QueryStatus {
    fn default() -> Self {
        Self::Error
    }
}

#[derive(Debug, Display, Error, From)]
pub enum GatewayError {
    #[error(ignore)]
    Anyhow(anyhow::Error),
    #[error(ignore)]
    #[from(ignore)]
    BadRequest(Cow<'static, str>),
    #[error(ignore)]
    #[from(ignore)]
    Forbidden(Cow<'static, str>),
    #[error(ignore)]
    #[from(ignore)]
    Internal(Cow<'static, str>),
    Join(JoinError),
    #[error(ignore)]
    #[from(ignore)]
    NotFound(Cow<'static, str>),
    SerdeJson(serde_json::Error),
    #[display(fmt = "{:?}", _0)]
    #[error(ignore)]
    Timeout(Option<tokio::time::error::Elapsed>),
    #[error(ignore)]
    #[from(ignore)]
    TooManyRequests(Cow<'static, str>),
    #[error(ignore)]
    #[from(ignore)]
    Upstream(Cow<'static, str>),
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(Some(err))
    }
}

/// The JSON body paired with a non-200 (or upstream-failure) response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub error: Cow<'static, str>,
    pub message: Cow<'static, str>,
}

impl GatewayError {
    pub fn as_response_parts(&self) -> (StatusCode, ErrorBody) {
        let (status, name, message): (StatusCode, &'static str, Cow<'static, str>) = match self {
            Self::Anyhow(err) => {
                warn!(?err, "anyhow");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                    err.to_string().into(),
                )
            }
            Self::BadRequest(msg) => {
                trace!(%msg, "BAD_REQUEST");
                (StatusCode::BAD_REQUEST, "Bad Request", msg.clone())
            }
            Self::Forbidden(msg) => {
                trace!(%msg, "FORBIDDEN");
                (StatusCode::FORBIDDEN, "Forbidden", msg.clone())
            }
            Self::Internal(msg) => {
                error!(%msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                    msg.clone(),
                )
            }
            Self::Join(err) => {
                warn!(?err, "JoinError");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                    "Unable to complete request".into(),
                )
            }
            Self::NotFound(msg) => {
                trace!(%msg, "NOT_FOUND");
                (StatusCode::NOT_FOUND, "Not Found", msg.clone())
            }
            Self::SerdeJson(err) => {
                trace!(?err, "serde json");
                (
                    StatusCode::BAD_REQUEST,
                    "Bad Request",
                    err.to_string().into(),
                )
            }
            Self::Timeout(elapsed) => {
                trace!(?elapsed, "timeout");
                (
                    StatusCode::REQUEST_TIMEOUT,
                    "Timeout",
                    "Request timed out".into(),
                )
            }
            Self::TooManyRequests(msg) => {
                trace!(%msg, "TOO_MANY_REQUESTS");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    "Too Many Requests",
                    msg.clone(),
                )
            }
            Self::Upstream(msg) => {
                // upstream failures are a 200 with an error body. the caller
                // already burned their attempts by the time one surfaces
                debug!(%msg, "upstream error");
                (StatusCode::OK, "Upstream Server Error", msg.clone())
            }
        };

        (
            status,
            ErrorBody {
                code: status.as_u16(),
                error: name.into(),
                message,
            },
        )
    }

    pub fn query_status(&self) -> QueryStatus {
        match self {
            Self::Timeout(_) => QueryStatus::Timeout,
            Self::Forbidden(_) | Self::TooManyRequests(_) => QueryStatus::Reject,
            Self::Upstream(_) => QueryStatus::Fail,
            _ => QueryStatus::Error,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, body) = self.as_response_parts();

        (status, Json(body)).into_response()
    }
}

pub trait GatewayErrorContext<T> {
    fn gw_context<S: Into<Cow<'static, str>>>(self, msg: S) -> GatewayResult<T>;
}

impl<T> GatewayErrorContext<T> for Option<T> {
    fn gw_context<S: Into<Cow<'static, str>>>(self, msg: S) -> GatewayResult<T> {
        self.ok_or_else(|| GatewayError::Internal(msg.into()))
    }
}

impl<T, E> GatewayErrorContext<T> for Result<T, E>
where
    E: Into<GatewayError>,
{
    fn gw_context<S: Into<Cow<'static, str>>>(self, msg: S) -> GatewayResult<T> {
        self.map_err(|err| {
            let err = err.into();
            warn!(%err, "error w/ context");
            GatewayError::Internal(msg.into())
        })
    }
}
