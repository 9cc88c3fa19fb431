//! JSON-RPC 2.0 over HTTP.
//!
//! One `POST /` route takes a request object (or a batch array), runs each
//! call against the [`Node`] and answers with the matching response objects.
//! Method names are `<prefix>_<name>`; the table lives in [`handlers`].
//! The server stops when the node's cancel token fires.

mod handlers;
mod params;

use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use ptt_protocol::ErrorKind;

use crate::node::{Node, NodeError};

pub use handlers::handle_call;
pub use params::Params;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Unknown method {0}")]
    UnknownMethod(String),

    #[error("Invalid params: {0}")]
    BadParams(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("Cannot encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::UnknownMethod(_) | RpcError::BadParams(_) => ErrorKind::BadInput,
            RpcError::Unauthorized(_) => ErrorKind::Unauthorized,
            RpcError::Node(e) => e.kind(),
            RpcError::Encode(_) => ErrorKind::Fatal,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            RpcError::UnknownMethod(_) => METHOD_NOT_FOUND,
            other => other.kind().rpc_code(),
        }
    }
}

macro_rules! node_error {
    ($($ty:path),* $(,)?) => {
        $(
            impl From<$ty> for RpcError {
                fn from(e: $ty) -> Self {
                    RpcError::Node(NodeError::from(e))
                }
            }
        )*
    };
}

node_error!(
    crate::entity::EntityError,
    crate::me::RaftError,
    crate::service::ServiceError,
    ptt_protocol::OplogError,
    ptt_protocol::JoinUrlError,
);

pub type Result<T> = std::result::Result<T, RpcError>;

// ─── Envelope ────────────────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct Request {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    fn ok(id: Value, result: Value) -> Self {
        Response {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, code: i64, message: String, kind: Option<ErrorKind>) -> Self {
        Response {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(ErrorObject {
                code,
                message,
                data: kind.map(|k| Value::String(k.as_str().to_string())),
            }),
        }
    }
}

/// Run one decoded request object.
async fn call(node: &Node, raw: Value) -> Response {
    let request: Request = match serde_json::from_value(raw) {
        Ok(r) => r,
        Err(e) => return Response::err(Value::Null, INVALID_REQUEST, e.to_string(), None),
    };
    if request.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
        return Response::err(request.id, INVALID_REQUEST, "jsonrpc must be 2.0".into(), None);
    }
    let params = match Params::from_value(request.params) {
        Ok(p) => p,
        Err(e) => return Response::err(request.id, e.code(), e.to_string(), Some(e.kind())),
    };
    match handle_call(node, &request.method, params).await {
        Ok(result) => Response::ok(request.id, result),
        Err(e) => {
            log::debug!("rpc: {} failed: {}", request.method, e);
            Response::err(request.id, e.code(), e.to_string(), Some(e.kind()))
        }
    }
}

/// Answer a whole HTTP body: a single call or a batch.
pub async fn dispatch(node: &Node, body: &[u8]) -> Value {
    let parsed: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => return json_of(Response::err(Value::Null, PARSE_ERROR, e.to_string(), None)),
    };
    match parsed {
        Value::Array(calls) if calls.is_empty() => {
            json_of(Response::err(Value::Null, INVALID_REQUEST, "empty batch".into(), None))
        }
        Value::Array(calls) => {
            let mut out = Vec::with_capacity(calls.len());
            for raw in calls {
                out.push(json_of(call(node, raw).await));
            }
            Value::Array(out)
        }
        raw => json_of(call(node, raw).await),
    }
}

fn json_of(response: Response) -> Value {
    serde_json::to_value(response).unwrap_or(Value::Null)
}

// ─── Server ──────────────────────────────────────────────────────────────────

async fn rpc(State(node): State<Node>, body: Bytes) -> Reply {
    Reply(dispatch(&node, &body).await)
}

/// HTTP wrapper: JSON-RPC answers are always `200 OK`.
struct Reply(Value);

impl IntoResponse for Reply {
    fn into_response(self) -> axum::response::Response {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            self.0.to_string(),
        )
            .into_response()
    }
}

pub fn create_app(node: Node) -> Router {
    Router::new().route("/", post(rpc)).with_state(node)
}

/// Running RPC listener.
pub struct RpcServer {
    addr: SocketAddr,
    task: JoinHandle<std::io::Result<()>>,
}

impl RpcServer {
    /// Bind `rpc_addr:rpc_port` and serve until the node stops.
    pub async fn spawn(node: Node) -> std::io::Result<RpcServer> {
        let endpoint = node.config().rpc_endpoint();
        let listener = TcpListener::bind(&endpoint).await?;
        let addr = listener.local_addr()?;
        let cancel = node.cancel_token();
        let app = create_app(node);
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
        });
        log::info!("RPC: listening on {addr}");
        Ok(RpcServer { addr, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the listener to drain after the node was cancelled.
    pub async fn stopped(self) {
        match self.task.await {
            Ok(Ok(())) => log::debug!("RPC: stopped"),
            Ok(Err(e)) => log::warn!("RPC: server error: {e}"),
            Err(e) => log::warn!("RPC: server task failed: {e}"),
        }
    }
}
