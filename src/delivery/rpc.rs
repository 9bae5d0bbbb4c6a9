//! JSON-RPC framing for the tool-call surface.
//!
//! The same handler serves two transports: the `mcp` subcommand speaks it
//! over stdio (newline-delimited JSON or Content-Length framing,
//! auto-detected from the first line and then fixed for the life of the
//! process), and the gateway exposes it at `POST /rpc` for network
//! clients. Tool results are text content; a failed tool call is reported
//! inside the result with `isError` rather than as a protocol error.

use std::io::{BufRead, BufReader, Write};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::delivery::toolcall::ToolCallSurface;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default, rename = "jsonrpc")]
    _jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub params: Option<Value>,
}

pub fn json_rpc_response(id: Option<Value>, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn json_rpc_error(id: Option<Value>, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

fn tool_text(text: &str) -> Value {
    json!({ "content": [{ "type": "text", "text": text }] })
}

fn tool_error(text: &str) -> Value {
    json!({ "content": [{ "type": "text", "text": text }], "isError": true })
}

pub struct RpcHandler {
    surface: ToolCallSurface,
}

impl RpcHandler {
    pub fn new(surface: ToolCallSurface) -> Self {
        Self { surface }
    }

    /// Parse and handle one raw frame. `None` means no response is owed
    /// (a notification).
    pub fn handle_raw(&self, raw: &str) -> Option<Value> {
        let data: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return Some(json_rpc_error(None, -32700, &format!("Parse error: {e}"))),
        };
        let id = data.as_object().and_then(|obj| obj.get("id").cloned());
        if !data
            .as_object()
            .is_some_and(|obj| obj.contains_key("method"))
        {
            return Some(json_rpc_error(id, -32600, "Invalid Request"));
        }
        let request: JsonRpcRequest = match serde_json::from_value(data) {
            Ok(v) => v,
            Err(e) => {
                return Some(json_rpc_error(id, -32600, &format!("Invalid Request: {e}")));
            }
        };
        self.handle(request)
    }

    pub fn handle(&self, request: JsonRpcRequest) -> Option<Value> {
        let JsonRpcRequest {
            method, id, params, ..
        } = request;

        if method.starts_with("notifications/") {
            debug!(method = %method, "Notification received");
            return None;
        }

        let response = match method.as_str() {
            "initialize" => json_rpc_response(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "nudge",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
            "ping" => json_rpc_response(id, json!({})),
            "tools/list" => json_rpc_response(id, json!({ "tools": tool_descriptors() })),
            "tools/call" => {
                let result = self.call_tool(params.unwrap_or(Value::Null));
                json_rpc_response(id, result)
            }
            other => {
                // Unknown notifications get no reply; unknown requests do
                if id.is_none() {
                    return None;
                }
                json_rpc_error(id, -32601, &format!("Method not found: {other}"))
            }
        };
        Some(response)
    }

    fn call_tool(&self, params: Value) -> Value {
        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
        let args = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        match name {
            "retrieve" => {
                let include_applied = args
                    .get("includeApplied")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                tool_text(&self.surface.retrieve(include_applied))
            }
            "markApplied" => match required_id(&args) {
                Ok(id) => match self.surface.mark_applied(id) {
                    Ok(reply) => tool_text(&reply),
                    Err(err) => tool_error(&err.to_string()),
                },
                Err(msg) => tool_error(msg),
            },
            "markFailed" => match required_id(&args) {
                Ok(id) => {
                    let reason = args
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("Agent reported failure");
                    match self.surface.mark_failed(id, reason) {
                        Ok(reply) => tool_text(&reply),
                        Err(err) => tool_error(&err.to_string()),
                    }
                }
                Err(msg) => tool_error(msg),
            },
            "inspect" => match required_id(&args) {
                Ok(id) => match self.surface.inspect(id) {
                    Ok(dump) => tool_text(&dump),
                    Err(err) => tool_error(&err.to_string()),
                },
                Err(msg) => tool_error(msg),
            },
            "clearAll" => match self.surface.clear_all() {
                Ok(reply) => tool_text(&reply),
                Err(err) => tool_error(&err.to_string()),
            },
            other => tool_error(&format!("Unknown tool: {other}")),
        }
    }
}

fn required_id(args: &Value) -> Result<&str, &'static str> {
    args.get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or("Missing required argument: id")
}

fn tool_descriptors() -> Value {
    json!([
        {
            "name": "retrieve",
            "description": "Get all pending visual changes as rendered prompts. Pending changes are handed over as processing. Pass includeApplied to see the whole queue without changing anything.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "includeApplied": {
                        "type": "boolean",
                        "description": "Include applied and processing changes (read-only)"
                    }
                }
            }
        },
        {
            "name": "markApplied",
            "description": "Report a change as applied in the project source.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "id": { "type": "string", "description": "The change id" }
                },
                "required": ["id"]
            }
        },
        {
            "name": "markFailed",
            "description": "Report a change as not applicable. It stays queued for the user to retry.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "id": { "type": "string", "description": "The change id" },
                    "reason": { "type": "string", "description": "Why it could not be applied" }
                },
                "required": ["id"]
            }
        },
        {
            "name": "inspect",
            "description": "Dump the full record of one change, delivery history included.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "id": { "type": "string", "description": "The change id" }
                },
                "required": ["id"]
            }
        },
        {
            "name": "clearAll",
            "description": "Drop every queued change and report what was dropped.",
            "inputSchema": { "type": "object", "properties": {} }
        }
    ])
}

// ── Stdio transport ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StdioMode {
    NewlineJson,
    ContentLength,
}

fn detect_mode(line: &str) -> Option<StdioMode> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some(StdioMode::NewlineJson);
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("content-length:") || lower.starts_with("content-type:") {
        return Some(StdioMode::ContentLength);
    }
    None
}

fn parse_content_length(line: &str) -> Option<usize> {
    let (key, value) = line.trim().split_once(':')?;
    if !key.trim().eq_ignore_ascii_case("content-length") {
        return None;
    }
    value.trim().parse().ok()
}

fn read_content_length_frame(
    reader: &mut impl BufRead,
    mut header: String,
) -> std::io::Result<Option<Vec<u8>>> {
    const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

    let mut content_length = parse_content_length(&header);
    loop {
        if header.trim_end().is_empty() {
            break;
        }
        header.clear();
        if reader.read_line(&mut header)? == 0 {
            return Ok(None);
        }
        if content_length.is_none() {
            content_length = parse_content_length(&header);
        }
    }

    let Some(len) = content_length else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        ));
    };
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Content-Length exceeds max allowed size",
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

fn write_frame(out: &mut impl Write, mode: StdioMode, resp: &Value) -> anyhow::Result<()> {
    match mode {
        StdioMode::NewlineJson => {
            writeln!(out, "{}", serde_json::to_string(resp)?)?;
        }
        StdioMode::ContentLength => {
            let body = serde_json::to_vec(resp)?;
            write!(out, "Content-Length: {}\r\n\r\n", body.len())?;
            out.write_all(&body)?;
        }
    }
    out.flush()?;
    Ok(())
}

/// Serve the tool surface over stdin/stdout until EOF.
pub fn run_stdio(handler: &RpcHandler) -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let mut stdout = std::io::stdout().lock();
    serve_frames(handler, &mut reader, &mut stdout)
}

fn serve_frames(
    handler: &RpcHandler,
    reader: &mut impl BufRead,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    info!("Serving tool calls on stdio");
    let mut mode: Option<StdioMode> = None;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }

        let effective = match mode {
            Some(m) => m,
            None => match detect_mode(&line) {
                Some(detected) => {
                    mode = Some(detected);
                    detected
                }
                None => continue,
            },
        };

        match effective {
            StdioMode::NewlineJson => {
                let raw = line.trim();
                if raw.is_empty() {
                    continue;
                }
                if let Some(resp) = handler.handle_raw(raw) {
                    write_frame(out, effective, &resp)?;
                }
            }
            StdioMode::ContentLength => {
                if line.trim().is_empty() {
                    continue;
                }
                let Some(body) = read_content_length_frame(reader, line)? else {
                    break;
                };
                let raw = String::from_utf8_lossy(&body);
                if let Some(resp) = handler.handle_raw(&raw) {
                    write_frame(out, effective, &resp)?;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::memory::MemoryStore;
    use crate::store::change::{Change, ChangeStatus, ElementDescriptor};
    use crate::store::ChangeStore;
    use tempfile::tempdir;
    use tokio::sync::broadcast;

    fn handler(dir: &std::path::Path) -> (RpcHandler, ChangeStore) {
        let store = ChangeStore::new(dir.join("tasks.json"));
        let memory = MemoryStore::new(dir.join("memory"));
        let (outbound, _) = broadcast::channel(64);
        let config = Config::with_data_dir(dir);
        let surface = ToolCallSurface::new(store.clone(), memory, outbound, config);
        (RpcHandler::new(surface), store)
    }

    fn add_change(store: &ChangeStore, id: &str) {
        store
            .add(Change::new(
                Some(id.to_string()),
                ElementDescriptor {
                    selector: ".cta".to_string(),
                    tag: "button".to_string(),
                    ..Default::default()
                },
                "make button blue".to_string(),
                "/tmp/proj".to_string(),
                "http://localhost:3000/".to_string(),
                None,
            ))
            .unwrap();
    }

    fn call(handler: &RpcHandler, raw: &str) -> Value {
        handler.handle_raw(raw).expect("expected a response")
    }

    #[test]
    fn initialize_advertises_tools() {
        let dir = tempdir().unwrap();
        let (handler, _) = handler(dir.path());

        let resp = call(
            &handler,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
        );
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(resp["result"]["serverInfo"]["name"], "nudge");
        assert!(resp["result"]["capabilities"]["tools"].is_object());
    }

    #[test]
    fn tools_list_names_the_full_surface() {
        let dir = tempdir().unwrap();
        let (handler, _) = handler(dir.path());

        let resp = call(&handler, r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#);
        let names: Vec<&str> = resp["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["retrieve", "markApplied", "markFailed", "inspect", "clearAll"]
        );
    }

    #[test]
    fn retrieve_tool_returns_rendered_text() {
        let dir = tempdir().unwrap();
        let (handler, store) = handler(dir.path());
        add_change(&store, "chg-1");

        let resp = call(
            &handler,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"retrieve","arguments":{}}}"#,
        );
        let text = resp["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("make button blue"));
        assert_eq!(store.get("chg-1").unwrap().status, ChangeStatus::Processing);
    }

    #[test]
    fn mark_applied_roundtrip_over_rpc() {
        let dir = tempdir().unwrap();
        let (handler, store) = handler(dir.path());
        add_change(&store, "chg-1");

        let resp = call(
            &handler,
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"markApplied","arguments":{"id":"chg-1"}}}"#,
        );
        assert!(resp["result"].get("isError").is_none());
        assert_eq!(store.get("chg-1").unwrap().status, ChangeStatus::Applied);
    }

    #[test]
    fn missing_id_is_a_tool_error_not_a_protocol_error() {
        let dir = tempdir().unwrap();
        let (handler, _) = handler(dir.path());

        let resp = call(
            &handler,
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"markApplied","arguments":{}}}"#,
        );
        assert_eq!(resp["result"]["isError"], true);
        assert!(resp["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("id"));
    }

    #[test]
    fn unknown_tool_is_reported_in_result() {
        let dir = tempdir().unwrap();
        let (handler, _) = handler(dir.path());

        let resp = call(
            &handler,
            r#"{"jsonrpc":"2.0","id":6,"method":"tools/call","params":{"name":"selfDestruct"}}"#,
        );
        assert_eq!(resp["result"]["isError"], true);
    }

    #[test]
    fn parse_error_is_minus_32700() {
        let dir = tempdir().unwrap();
        let (handler, _) = handler(dir.path());
        let resp = call(&handler, "{broken");
        assert_eq!(resp["error"]["code"], -32700);
    }

    #[test]
    fn missing_method_is_invalid_request() {
        let dir = tempdir().unwrap();
        let (handler, _) = handler(dir.path());
        let resp = call(&handler, r#"{"jsonrpc":"2.0","id":7}"#);
        assert_eq!(resp["error"]["code"], -32600);
        assert_eq!(resp["id"], 7);
    }

    #[test]
    fn unknown_method_is_minus_32601() {
        let dir = tempdir().unwrap();
        let (handler, _) = handler(dir.path());
        let resp = call(&handler, r#"{"jsonrpc":"2.0","id":8,"method":"fly"}"#);
        assert_eq!(resp["error"]["code"], -32601);
    }

    #[test]
    fn notifications_get_no_response() {
        let dir = tempdir().unwrap();
        let (handler, _) = handler(dir.path());
        assert!(handler
            .handle_raw(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .is_none());
    }

    #[test]
    fn newline_framing_end_to_end() {
        let dir = tempdir().unwrap();
        let (handler, _) = handler(dir.path());

        let input = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\"}\n".to_vec();
        let mut reader = BufReader::new(&input[..]);
        let mut out = Vec::new();
        serve_frames(&handler, &mut reader, &mut out).unwrap();

        let written = String::from_utf8(out).unwrap();
        assert!(written.ends_with('\n'));
        let resp: Value = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(resp["result"]["serverInfo"]["name"], "nudge");
    }

    #[test]
    fn content_length_framing_end_to_end() {
        let dir = tempdir().unwrap();
        let (handler, _) = handler(dir.path());

        let body = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        let input = format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes();
        let mut reader = BufReader::new(&input[..]);
        let mut out = Vec::new();
        serve_frames(&handler, &mut reader, &mut out).unwrap();

        let written = String::from_utf8(out).unwrap();
        assert!(written.starts_with("Content-Length:"));
        let json_start = written.find('{').unwrap();
        let resp: Value = serde_json::from_str(&written[json_start..]).unwrap();
        assert_eq!(resp["id"], 1);
    }
}
