//! HTTP control surface
//!
//! Thin producer of control actions on top of [`ControlHandle`]:
//!
//! - `GET /add?num=<port>&protocol=<tcp|udp>`
//! - `GET /remove?num=<port>&protocol=<tcp|udp>`
//! - `GET /stop` tears down every port; the daemon keeps running
//! - `GET /ports` lists registered ports
//! - `GET /metrics` Prometheus text format

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::control_loop::{ControlHandle, PortStatus, ShutdownReport};
use crate::error::AgentError;
use crate::metrics::MetricsCollector;

/// JSON response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiErrorResponse>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: ApiErrorResponse) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Error response structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiErrorResponse {
    /// HTTP status code
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiErrorResponse {
    fn from_agent_error(err: &AgentError) -> Self {
        let status = status_for(err);
        Self {
            code: status.as_u16(),
            message: err.to_string(),
            details: std::error::Error::source(err).map(|s| s.to_string()),
        }
    }
}

/// Maps a control error to the status returned to the caller.
pub fn status_for(err: &AgentError) -> StatusCode {
    match err {
        AgentError::InvalidProtocol(_) | AgentError::InvalidPortNumber(_) => {
            StatusCode::BAD_REQUEST
        }
        AgentError::PortNotRegistered { .. } => StatusCode::NOT_FOUND,
        AgentError::PortAlreadyRegistered { .. } => StatusCode::CONFLICT,
        AgentError::LoopClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `num` and `protocol` query parameters, both required.
///
/// Kept as strings so a malformed value is answered with the same JSON
/// envelope as every other error.
#[derive(Debug, Default, Deserialize)]
pub struct PortQuery {
    pub num: Option<String>,
    pub protocol: Option<String>,
}

impl PortQuery {
    fn parse(&self) -> Result<(u32, &str), AgentError> {
        let num = self.num.as_deref().unwrap_or_default().trim();
        let number = num
            .parse::<u32>()
            .map_err(|_| AgentError::InvalidPortNumber(num.to_string()))?;
        let protocol = self.protocol.as_deref().unwrap_or_default();
        Ok((number, protocol))
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub control: ControlHandle,
    pub metrics: MetricsCollector,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/add", get(add_port))
        .route("/remove", get(remove_port))
        .route("/stop", get(stop))
        .route("/ports", get(list_ports))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serves the control surface until the listener fails.
pub async fn serve(listener: tokio::net::TcpListener, state: ApiState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP control surface listening");
    }
    axum::serve(listener, router(state)).await
}

fn respond<T: Serialize>(result: Result<T, AgentError>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))).into_response(),
        Err(e) => {
            let body = ApiErrorResponse::from_agent_error(&e);
            let status = status_for(&e);
            if status.is_server_error() {
                error!(error = %e, "Control request failed");
            }
            (status, Json(ApiResponse::<()>::error(body))).into_response()
        }
    }
}

pub async fn add_port(State(state): State<ApiState>, Query(query): Query<PortQuery>) -> Response {
    let result = match query.parse() {
        Ok((number, protocol)) => state.control.submit_add(number, protocol).await,
        Err(e) => Err(e),
    };
    respond(result.map(|()| "added"))
}

pub async fn remove_port(
    State(state): State<ApiState>,
    Query(query): Query<PortQuery>,
) -> Response {
    let result = match query.parse() {
        Ok((number, protocol)) => state.control.submit_remove(number, protocol).await,
        Err(e) => Err(e),
    };
    respond(result.map(|()| "removed"))
}

pub async fn stop(State(state): State<ApiState>) -> Response {
    let result: Result<ShutdownReport, AgentError> = state.control.submit_shutdown().await;
    respond(result)
}

pub async fn list_ports(State(state): State<ApiState>) -> Response {
    let result: Result<Vec<PortStatus>, AgentError> = state.control.snapshot().await;
    respond(result)
}

pub async fn metrics(State(state): State<ApiState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfiguratorError, ConfiguratorOp};
    use crate::types::{PortKey, Protocol};

    #[test]
    fn test_status_mapping() {
        let port = PortKey::new(Protocol::Tcp, 80);
        assert_eq!(
            status_for(&AgentError::InvalidProtocol("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&AgentError::InvalidPortNumber("0".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&AgentError::PortNotRegistered { port }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&AgentError::PortAlreadyRegistered { port }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&AgentError::LoopClosed),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&ConfiguratorError::new(port, ConfiguratorOp::RegisterPort, "x").into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_port_query_parse() {
        let query = PortQuery {
            num: Some(" 8080 ".into()),
            protocol: Some("tcp".into()),
        };
        assert_eq!(query.parse().unwrap(), (8080, "tcp"));

        let query = PortQuery {
            num: Some("http".into()),
            protocol: Some("tcp".into()),
        };
        assert!(matches!(query.parse(), Err(AgentError::InvalidPortNumber(n)) if n == "http"));

        assert!(matches!(
            PortQuery::default().parse(),
            Err(AgentError::InvalidPortNumber(_))
        ));
    }

    #[test]
    fn test_api_response_envelopes() {
        let ok = serde_json::to_value(ApiResponse::success("added")).unwrap();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["data"], "added");

        let err = ApiErrorResponse::from_agent_error(&AgentError::PortNotRegistered {
            port: PortKey::new(Protocol::Udp, 53),
        });
        assert_eq!(err.code, 404);
        let value = serde_json::to_value(ApiResponse::<()>::error(err)).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["message"], "Port udp-53 is not registered");
        assert!(value["error"].get("details").is_none());
    }
}
