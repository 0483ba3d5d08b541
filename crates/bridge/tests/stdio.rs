use mcp_openapi_bridge_test_support::{MockApi, PASSWORD, USERNAME};
use serde_json::{Value, json};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

fn bridge_command(api: &MockApi, password: &str) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_mcp-openapi-bridge"));
    cmd.env_clear()
        .env("API_BASE_URL", api.base_url())
        .env("API_USERNAME", USERNAME)
        .env("API_PASSWORD", password)
        .env("API_TIMEOUT_SECS", "5")
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

struct Session {
    _child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Session {
    fn spawn(api: &MockApi) -> Session {
        let mut child = bridge_command(api, PASSWORD).spawn().expect("spawn bridge");
        let stdin = child.stdin.take().expect("stdin");
        let stdout = BufReader::new(child.stdout.take().expect("stdout")).lines();
        Session {
            _child: child,
            stdin,
            stdout,
        }
    }

    async fn request(&mut self, msg: Value) -> Value {
        let mut line = serde_json::to_string(&msg).expect("encode");
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await.expect("write");
        self.stdin.flush().await.expect("flush");
        let reply = tokio::time::timeout(Duration::from_secs(10), self.stdout.next_line())
            .await
            .expect("reply in time")
            .expect("read")
            .expect("bridge closed stdout");
        serde_json::from_str(&reply).expect("reply is json")
    }
}

#[tokio::test]
async fn serves_tools_over_stdio() {
    let api = MockApi::start_default().await.expect("mock");
    let mut session = Session::spawn(&api);

    let init = session
        .request(json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": { "protocolVersion": "2025-06-18", "capabilities": {}, "clientInfo": { "name": "t", "version": "0" } }
        }))
        .await;
    assert_eq!(init["result"]["serverInfo"]["name"], "Demo Vendor API");

    let list = session
        .request(json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }))
        .await;
    let tools = list["result"]["tools"].as_array().expect("tools");
    assert_eq!(tools.len(), 9);
    let get_host = tools
        .iter()
        .find(|t| t["name"] == "getHost")
        .expect("getHost");
    assert_eq!(get_host["inputSchema"]["required"], json!(["id"]));

    let call = session
        .request(json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": { "name": "getHost", "arguments": { "id": "42" } }
        }))
        .await;
    assert_eq!(call["result"]["isError"], false);
    let text = call["result"]["content"][0]["text"].as_str().expect("text");
    let echoed: Value = serde_json::from_str(text).expect("echo body");
    assert_eq!(echoed["path"], "/hosts/42");

    let bad = session
        .request(json!({
            "jsonrpc": "2.0", "id": 4, "method": "tools/call",
            "params": { "name": "getHost", "arguments": {} }
        }))
        .await;
    assert_eq!(bad["result"]["isError"], true);
    assert_eq!(api.login_count(), 1);
}

#[tokio::test]
async fn bad_credentials_exit_nonzero() {
    let api = MockApi::start_default().await.expect("mock");
    let output = tokio::time::timeout(
        Duration::from_secs(20),
        bridge_command(&api, "wrong").output(),
    )
    .await
    .expect("exits in time")
    .expect("run bridge");

    assert_eq!(output.status.code(), Some(2));
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("uthentication"), "{stderr}");
}
