//! JSON-RPC 2.0 over HTTP
//!
//! `POST /rpc` with `Authorization: Bearer <token>`; the token maps to an
//! owner in `[server.tokens]`. Each request gets its own SQLite connection on
//! the blocking pool, so a slow learning run never stalls the accept loop.

use crate::config::LoopConfig;
use crate::db;
use crate::error::LoopError;
use crate::tools;
use anyhow::{Context, Result};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const MAX_BODY_BYTES: usize = 1 << 20;

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const UNAUTHORIZED: i64 = -32001;

struct ServerState {
    db_path: PathBuf,
    config: LoopConfig,
}

/// Serve until the process exits
pub async fn serve(db_path: PathBuf, config: LoopConfig, port: u16) -> Result<()> {
    if config.server.tokens.is_empty() {
        tracing::warn!("No tokens configured under [server.tokens]; every tools/call will be refused");
    }
    // Schema is created once up front
    db::init_db(&db_path)?;

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    tracing::info!(port, db = ?db_path, "Listening on http://127.0.0.1:{}/rpc", port);

    let state = Arc::new(ServerState { db_path, config });
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                tracing::warn!(%peer, error = %e, "Request failed");
            }
        });
    }
}

struct HttpRequest {
    method: String,
    path: String,
    bearer: Option<String>,
    body: Vec<u8>,
}

async fn read_request(stream: &mut TcpStream) -> Result<Option<HttpRequest>> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(None);
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    let mut bearer = None;
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).await?;
        let header = header.trim();
        if header.is_empty() {
            break;
        }
        let Some((name, value)) = header.split_once(':') else {
            continue;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "content-length" => content_length = value.trim().parse().unwrap_or(0),
            "authorization" => bearer = parse_bearer(value),
            _ => {}
        }
    }
    if content_length > MAX_BODY_BYTES {
        anyhow::bail!("request body of {} bytes exceeds limit", content_length);
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    Ok(Some(HttpRequest {
        method,
        path,
        bearer,
        body,
    }))
}

async fn handle_connection(mut stream: TcpStream, state: Arc<ServerState>) -> Result<()> {
    let Some(request) = read_request(&mut stream).await? else {
        return Ok(());
    };

    if request.method != "POST" || request.path != "/rpc" {
        return write_response(&mut stream, "404 Not Found", &json!({"error": "POST /rpc"})).await;
    }

    let response = match serde_json::from_slice::<Value>(&request.body) {
        Err(e) => rpc_error(Value::Null, PARSE_ERROR, "parse_error", &e.to_string()),
        Ok(body) => {
            let bearer = request.bearer;
            tokio::task::spawn_blocking(move || -> Result<Value> {
                let conn = db::init_db(&state.db_path)?;
                Ok(handle_rpc(&conn, &state.config, bearer.as_deref(), &body))
            })
            .await??
        }
    };
    write_response(&mut stream, "200 OK", &response).await
}

async fn write_response(stream: &mut TcpStream, status: &str, body: &Value) -> Result<()> {
    let body = serde_json::to_string(body)?;
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Token from an `Authorization` header value
pub fn parse_bearer(header: &str) -> Option<String> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

fn rpc_error(id: Value, code: i64, kind: &str, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message, "data": {"kind": kind}}
    })
}

fn loop_error(id: Value, e: &LoopError) -> Value {
    rpc_error(id, e.rpc_code(), e.kind(), &e.to_string())
}

/// Answer one JSON-RPC request
pub fn handle_rpc(conn: &Connection, config: &LoopConfig, bearer: Option<&str>, request: &Value) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    if request.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return rpc_error(id, INVALID_REQUEST, "invalid_request", "expected jsonrpc 2.0");
    }
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return rpc_error(id, INVALID_REQUEST, "invalid_request", "missing method");
    };
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

    match method {
        "tools/list" => json!({"jsonrpc": "2.0", "id": id, "result": {"tools": tools::get_tools()}}),
        "tools/call" => {
            let Some(owner) = bearer.and_then(|t| config.server.tokens.get(t)) else {
                return rpc_error(id, UNAUTHORIZED, "unauthorized", "missing or unknown bearer token");
            };
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return loop_error(id, &LoopError::InvalidInput("missing tool name".into()));
            };
            let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            match tools::call_tool(conn, config, owner, name, &args) {
                Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                Err(e) => {
                    if matches!(e, LoopError::Storage(_) | LoopError::Serialization(_)) {
                        tracing::error!(owner = %owner, tool = name, error = %e, "Tool failed");
                    }
                    loop_error(id, &e)
                }
            }
        }
        other => rpc_error(id, METHOD_NOT_FOUND, "method_not_found", &format!("unknown method: {}", other)),
    }
}
