//! Line-delimited JSON-RPC over stdio: the MCP surface the host talks to.

use mcp_openapi_bridge_core::ToolProvider;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Versions a client may ask for; anything else is answered with [`PROTOCOL_VERSION`].
const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2024-11-05", "2025-03-26", PROTOCOL_VERSION];

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

pub struct McpServer {
    provider: Arc<dyn ToolProvider>,
}

impl McpServer {
    pub fn new(provider: Arc<dyn ToolProvider>) -> Self {
        Self { provider }
    }

    /// Serve requests until the reader hits EOF.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(response) = self.handle_line(line).await {
                write_jsonrpc(&mut writer, &response).await?;
            }
        }
        tracing::debug!("stdin closed");
        Ok(())
    }

    /// Handle one raw line. `None` means nothing is written back (notifications).
    pub async fn handle_line(&self, line: &str) -> Option<Value> {
        let msg: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                return Some(error_response(
                    Value::Null,
                    PARSE_ERROR,
                    "parse error",
                    Some(json!({ "detail": e.to_string() })),
                ));
            }
        };
        if msg.is_array() {
            return Some(error_response(
                Value::Null,
                INVALID_REQUEST,
                "batching not supported",
                None,
            ));
        }

        let id = msg.get("id").cloned();
        let Some(method) = msg.get("method").and_then(Value::as_str) else {
            return id.map(|id| error_response(id, INVALID_REQUEST, "missing method", None));
        };
        let Some(id) = id else {
            tracing::debug!(method, "notification");
            return None;
        };
        let params = msg.get("params").cloned().unwrap_or(Value::Null);

        Some(match self.dispatch(method, params).await {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err((code, message)) => error_response(id, code, &message, None),
        })
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, (i64, String)> {
        match method {
            "initialize" => {
                let version = params
                    .get("protocolVersion")
                    .and_then(Value::as_str)
                    .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
                    .unwrap_or(PROTOCOL_VERSION);
                let (name, server_version) = self.provider.server_info();
                Ok(json!({
                    "protocolVersion": version,
                    "capabilities": { "tools": { "listChanged": false } },
                    "serverInfo": { "name": name, "version": server_version },
                }))
            }
            "ping" => Ok(json!({})),
            "tools/list" => {
                let tools = self.provider.list_tools();
                Ok(json!({ "tools": tools }))
            }
            "tools/call" => {
                let Some(name) = params.get("name").and_then(Value::as_str) else {
                    return Err((INVALID_PARAMS, "tools/call requires a string 'name'".into()));
                };
                let arguments = params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                tracing::debug!(tool = name, "tools/call");
                let result = self.provider.call_tool(name, arguments).await;
                serde_json::to_value(result).map_err(|e| (INTERNAL_ERROR, e.to_string()))
            }
            other => Err((METHOD_NOT_FOUND, format!("method not found: {other}"))),
        }
    }
}

fn error_response(id: Value, code: i64, message: &str, data: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

async fn write_jsonrpc<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Value) -> anyhow::Result<()> {
    let line = serde_json::to_string(msg)?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rmcp::model::{CallToolResult, Content, JsonObject, Tool};

    struct Fixed;

    #[async_trait]
    impl ToolProvider for Fixed {
        fn server_info(&self) -> (String, String) {
            ("Fixed API".to_string(), "1.0".to_string())
        }

        fn list_tools(&self) -> Vec<Tool> {
            let schema: JsonObject = serde_json::from_value(json!({ "type": "object" }))
                .expect("schema");
            vec![Tool::new("echo", "Echo arguments", Arc::new(schema))]
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> CallToolResult {
            CallToolResult::success(vec![Content::text(format!("{name}:{arguments}"))])
        }
    }

    fn server() -> McpServer {
        McpServer::new(Arc::new(Fixed))
    }

    #[tokio::test]
    async fn initialize_reports_provider_info() {
        let resp = server()
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#)
            .await
            .expect("response");
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(resp["result"]["serverInfo"]["name"], "Fixed API");
        assert!(resp["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn initialize_negotiates_protocol_version() {
        let s = server();
        let known = s
            .handle_line(
                r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#,
            )
            .await
            .expect("response");
        assert_eq!(known["result"]["protocolVersion"], "2024-11-05");

        let unknown = s
            .handle_line(
                r#"{"jsonrpc":"2.0","id":2,"method":"initialize","params":{"protocolVersion":"1999-01-01"}}"#,
            )
            .await
            .expect("response");
        assert_eq!(unknown["result"]["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn tools_list_and_call() {
        let s = server();
        let list = s
            .handle_line(r#"{"jsonrpc":"2.0","id":"a","method":"tools/list"}"#)
            .await
            .expect("response");
        assert_eq!(list["result"]["tools"][0]["name"], "echo");
        assert_eq!(list["result"]["tools"][0]["inputSchema"]["type"], "object");

        let call = s
            .handle_line(
                r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"echo","arguments":{"x":1}}}"#,
            )
            .await
            .expect("response");
        assert_eq!(call["result"]["content"][0]["text"], r#"echo:{"x":1}"#);
    }

    #[tokio::test]
    async fn protocol_errors() {
        let s = server();
        let parse = s.handle_line("{not json").await.expect("response");
        assert_eq!(parse["error"]["code"], PARSE_ERROR);
        assert!(parse["id"].is_null());

        let unknown = s
            .handle_line(r#"{"jsonrpc":"2.0","id":3,"method":"resources/list"}"#)
            .await
            .expect("response");
        assert_eq!(unknown["error"]["code"], METHOD_NOT_FOUND);

        let no_name = s
            .handle_line(r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{}}"#)
            .await
            .expect("response");
        assert_eq!(no_name["error"]["code"], INVALID_PARAMS);

        let batch = s.handle_line("[]").await.expect("response");
        assert_eq!(batch["error"]["code"], INVALID_REQUEST);

        assert!(
            s.handle_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn serve_writes_one_line_per_request() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "\n",
        );
        let mut out = Vec::new();
        server()
            .serve(input.as_bytes(), &mut out)
            .await
            .expect("serve");

        let lines: Vec<Value> = String::from_utf8(out)
            .expect("utf8")
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], 1);
        assert_eq!(lines[0]["result"], json!({}));
        assert_eq!(lines[1]["id"], 2);
    }
}
