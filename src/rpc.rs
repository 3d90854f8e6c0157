//! Stdio tool-protocol binding.
//!
//! Speaks line-delimited JSON-RPC 2.0 over stdin/stdout with the
//! `initialize` / `tools/list` / `tools/call` shape agent runtimes mount
//! tools through. Each `tools/call` dispatches into the same catalog as the
//! HTTP binding; operation failures come back as tool results with
//! `isError: true`, protocol failures as JSON-RPC error objects.
//!
//! Logging goes to stderr in this mode so stdout stays a clean protocol
//! stream.

use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::tools::{App, CATALOG, ToolError};

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

/// Serve the tool protocol until stdin closes or the token cancels.
pub async fn serve(app: Arc<App>, cancel: CancellationToken) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                if let Some(response) = handle_line(&app, &line).await {
                    stdout.write_all(response.to_string().as_bytes()).await?;
                    stdout.write_all(b"\n").await?;
                    stdout.flush().await?;
                }
            }
        }
    }
    Ok(())
}

/// Handle one protocol line. Returns `None` for notifications, which get no
/// response.
async fn handle_line(app: &App, line: &str) -> Option<Value> {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return Some(rpc_error(Value::Null, PARSE_ERROR, format!("Parse error: {e}")));
        }
    };

    if request.id.is_none() {
        // Notifications (e.g. notifications/initialized) are fire-and-forget.
        return None;
    }
    let id = request.id.clone().unwrap_or(Value::Null);

    match handle_request(app, request).await {
        Ok(result) => Some(json!({ "jsonrpc": "2.0", "id": id, "result": result })),
        Err((code, message)) => Some(rpc_error(id, code, message)),
    }
}

async fn handle_request(app: &App, request: RpcRequest) -> Result<Value, (i64, String)> {
    match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": { "tools": {} },
        })),
        "ping" => Ok(json!({})),
        "tools/list" => {
            let tools: Vec<Value> = CATALOG
                .iter()
                .map(|spec| {
                    json!({
                        "name": spec.name,
                        "description": spec.description,
                        "inputSchema": (spec.input_schema)(),
                    })
                })
                .collect();
            Ok(json!({ "tools": tools }))
        }
        "tools/call" => {
            #[derive(Deserialize)]
            struct CallParams {
                name: String,
                #[serde(default)]
                arguments: Option<Value>,
            }
            let params: CallParams =
                serde_json::from_value(request.params.unwrap_or_else(|| json!({})))
                    .map_err(|e| (INVALID_PARAMS, format!("Invalid params: {e}")))?;
            let arguments = params.arguments.unwrap_or(Value::Null);
            match app.dispatch(&params.name, arguments).await {
                Ok(value) => Ok(tool_result(value.to_string(), false)),
                Err(ToolError::UnknownOperation(name)) => {
                    Err((METHOD_NOT_FOUND, format!("Unknown tool: {name}")))
                }
                Err(e) => Ok(tool_result(e.to_string(), true)),
            }
        }
        other => Err((METHOD_NOT_FOUND, format!("Unknown method: {other}"))),
    }
}

fn tool_result(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

fn rpc_error(id: Value, code: i64, message: String) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;

    async fn app() -> (tempfile::TempDir, Arc<App>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).await.unwrap());
        (dir, App::new(store, false))
    }

    #[tokio::test]
    async fn initialize_and_list_tools() {
        let (_dir, app) = app().await;
        let response = handle_line(
            &app,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
        )
        .await
        .unwrap();
        assert_eq!(response["result"]["protocolVersion"], PROTOCOL_VERSION);

        let response = handle_line(&app, r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .await
            .unwrap();
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), CATALOG.len());
        assert!(tools.iter().any(|t| t["name"] == "pay"));
    }

    #[tokio::test]
    async fn tools_call_dispatches_and_reports_errors_in_band() {
        let (_dir, app) = app().await;
        let response = handle_line(
            &app,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"config"}}"#,
        )
        .await
        .unwrap();
        assert_eq!(response["result"]["isError"], false);
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        let value: Value = serde_json::from_str(text).unwrap();
        assert_eq!(value["demoMode"], false);

        // Operation failure is a tool result, not a protocol error.
        let response = handle_line(
            &app,
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"getRules"}}"#,
        )
        .await
        .unwrap();
        assert_eq!(response["result"]["isError"], true);

        // Unknown tool is a protocol error.
        let response = handle_line(
            &app,
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"mintMoney"}}"#,
        )
        .await
        .unwrap();
        assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let (_dir, app) = app().await;
        let response = handle_line(
            &app,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn malformed_lines_report_parse_errors() {
        let (_dir, app) = app().await;
        let response = handle_line(&app, "{not json").await.unwrap();
        assert_eq!(response["error"]["code"], PARSE_ERROR);
    }
}
