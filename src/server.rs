use futures_util::FutureExt;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader};

use crate::config::Args;
use crate::db::{ConnectionManager, PoolSettings, Target};
use crate::error::ServerError;
use crate::executor::QueryLimits;
use crate::liveness::{self, ActivityClock};
use crate::rpc::{
    CallToolParams, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcWriter,
    ServerCapabilities, ServerInfo, ToolsCapability,
};
use crate::tools::{ToolContext, ToolRegistry};

pub const SERVER_NAME: &str = "mysql-mcp-server";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Initialized,
    ShuttingDown,
    Terminated,
}

/// Whether the loop keeps reading after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

#[derive(Debug)]
pub struct Reply {
    pub response: Option<JsonRpcResponse>,
    pub flow: Flow,
}

impl Reply {
    fn respond(response: JsonRpcResponse) -> Self {
        Self {
            response: Some(response),
            flow: Flow::Continue,
        }
    }
}

/// Everything one client connection can change.
pub struct Session {
    state: State,
    db: ConnectionManager,
    startup_target: Option<Target>,
    connect_attempts: u32,
    limits: QueryLimits,
    registry: ToolRegistry,
    activity: Arc<ActivityClock>,
}

impl Session {
    pub fn new(settings: PoolSettings, limits: QueryLimits, startup_target: Option<Target>) -> Self {
        Self {
            state: State::Uninitialized,
            db: ConnectionManager::new(settings),
            startup_target,
            connect_attempts: 1,
            limits,
            registry: ToolRegistry::new(),
            activity: Arc::new(ActivityClock::new()),
        }
    }

    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn activity(&self) -> Arc<ActivityClock> {
        Arc::clone(&self.activity)
    }

    /// Build the pool for the startup target, if there is one.
    pub async fn connect_startup_target(&mut self) -> Result<(), ServerError> {
        if let Some(target) = self.startup_target.clone() {
            info!("Connecting to {target} before serving requests");
            self.db
                .configure(target, self.connect_attempts)
                .await
                .map_err(ServerError::Startup)?;
        }
        Ok(())
    }

    /// Close the pool. Safe to call more than once.
    pub async fn close(&mut self) {
        self.db.close().await;
    }

    /// Handle one raw input line.
    pub async fn handle_line(&mut self, line: &[u8]) -> Reply {
        self.activity.touch();

        let value: Value = match serde_json::from_slice(line) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to parse request: {e}");
                return Reply::respond(JsonRpcResponse::error(None, JsonRpcError::parse_error()));
            }
        };
        let envelope_id = value.get("id").cloned();
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                warn!("Invalid request envelope: {e}");
                return Reply::respond(JsonRpcResponse::error(
                    envelope_id,
                    JsonRpcError::invalid_request(format!("Invalid request: {e}")),
                ));
            }
        };

        debug!("Parsed request: method={}, id={:?}", request.method, request.id);
        let id = request.id.clone();
        let notification = request.is_notification();
        let method = request.method.clone();

        let handled = AssertUnwindSafe(self.dispatch(request)).catch_unwind().await;
        let (outcome, flow) = match handled {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Handler for {method} panicked: {message}");
                (Err(JsonRpcError::internal(format!("Internal error: {message}"))), Flow::Continue)
            }
        };

        if notification {
            if let Err(e) = outcome {
                debug!("Dropping error for notification {method}: {}", e.message);
            }
            return Reply { response: None, flow };
        }

        let response = match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => JsonRpcResponse::error(id, e),
        };
        Reply {
            response: Some(response),
            flow,
        }
    }

    async fn dispatch(&mut self, request: JsonRpcRequest) -> (Result<Value, JsonRpcError>, Flow) {
        match request.method.as_str() {
            "initialize" => (self.initialize().await, Flow::Continue),
            "initialized" | "notifications/initialized" => {
                debug!("Received initialization notification: {}", request.method);
                (Ok(Value::Null), Flow::Continue)
            }
            "shutdown" => {
                info!("Shutdown requested");
                self.state = State::ShuttingDown;
                (Ok(Value::Null), Flow::Continue)
            }
            "exit" => {
                info!("Received exit notification");
                self.close().await;
                self.state = State::Terminated;
                (Ok(Value::Null), Flow::Exit)
            }
            "MCP/listTools" => {
                debug!("Listing available tools");
                (Ok(self.registry.list()), Flow::Continue)
            }
            "MCP/callTool" => (self.call_tool(request.params).await, Flow::Continue),
            other => {
                warn!("Unknown method: {other}");
                (Err(JsonRpcError::method_not_found(other)), Flow::Continue)
            }
        }
    }

    async fn initialize(&mut self) -> Result<Value, JsonRpcError> {
        if let Some(target) = self.startup_target.clone() {
            let live = self.db.is_configured() && self.db.ping().await.is_ok();
            if !live {
                warn!("Connection pool for {target} is not live, reconnecting");
                self.db
                    .configure(target, 1)
                    .await
                    .map_err(|e| JsonRpcError::internal(format!("Database connection failed: {e}")))?;
            }
        }

        self.state = State::Initialized;
        info!("Session initialized");
        serde_json::to_value(InitializeResult {
            capabilities: ServerCapabilities {
                tools: ToolsCapability { list_changed: false },
            },
            server_info: ServerInfo {
                name: SERVER_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        })
        .map_err(|e| JsonRpcError::internal(e.to_string()))
    }

    async fn call_tool(&mut self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        if !matches!(self.state, State::Initialized | State::ShuttingDown) {
            return Err(JsonRpcError::not_initialized());
        }
        let params = params.ok_or_else(|| JsonRpcError::invalid_params("Missing parameters"))?;
        let call: CallToolParams = serde_json::from_value(params)
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid tool call parameters: {e}")))?;

        debug!("Handling tool call: {}", call.tool);
        let ctx = ToolContext {
            db: &mut self.db,
            limits: &self.limits,
        };
        let result = self.registry.call(&call.tool, call.parameters, ctx).await;
        if !result.is_success() {
            debug!("Tool {} reported failure", call.tool);
        }
        serde_json::to_value(result).map_err(|e| JsonRpcError::internal(e.to_string()))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Read requests from `input` until end of input, `exit`, or `shutdown`
/// resolves. The session is left open; the caller closes it.
pub async fn serve<R, W, S>(
    session: &mut Session,
    input: R,
    output: &RpcWriter<W>,
    shutdown: S,
) -> Result<(), ServerError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let mut reader = input;
    let mut line = Vec::new();
    tokio::pin!(shutdown);

    loop {
        line.clear();
        let read = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                return Ok(());
            }
            read = reader.read_until(b'\n', &mut line) => read,
        };

        match read {
            Ok(0) => {
                info!("stdin closed - client disconnected, shutting down server");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                error!("Error reading from stdin: {e}");
                return Err(ServerError::Io(e));
            }
        }

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        debug!("Received message (len={})", line.len());

        let reply = session.handle_line(&line).await;
        if let Some(response) = reply.response {
            if let Err(e) = output.send(&response).await {
                error!("Failed to write response: {e}");
                return Err(ServerError::Io(e));
            }
        }
        if reply.flow == Flow::Exit {
            return Ok(());
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM. The handlers are installed before this
/// returns, so a signal that arrives before the first poll is not lost.
#[cfg(unix)]
fn shutdown_signal() -> impl Future<Output = ()> {
    use tokio::signal::unix::{signal, SignalKind};

    let handlers = signal(SignalKind::interrupt())
        .and_then(|interrupt| Ok((interrupt, signal(SignalKind::terminate())?)));
    async move {
        match handlers {
            Ok((mut interrupt, mut terminate)) => {
                tokio::select! {
                    _ = interrupt.recv() => info!("Received Ctrl+C"),
                    _ = terminate.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to install signal handlers: {e}");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
fn shutdown_signal() -> impl Future<Output = ()> {
    async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C"),
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {e}");
                std::future::pending::<()>().await;
            }
        }
    }
}

pub async fn run(args: Args) -> Result<(), ServerError> {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let startup_target = args.startup_target()?;
    match &startup_target {
        Some(target) => info!("Server config: {target}, row_limit={}", args.row_limit),
        None => info!("No startup credentials; waiting for connect_db"),
    }
    info!("Server PID: {}", std::process::id());

    let mut session = Session::new(args.pool_settings(), args.query_limits(), startup_target)
        .with_connect_attempts(args.connect_retries);

    let connected = tokio::select! {
        connected = session.connect_startup_target() => Some(connected),
        _ = &mut shutdown => None,
    };
    match connected {
        Some(connected) => connected?,
        None => {
            info!("Shutdown signal received during startup");
            session.close().await;
            return Ok(());
        }
    }

    let output = RpcWriter::new(tokio::io::stdout());
    let keepalive = liveness::spawn_keepalive(
        session.activity(),
        output.clone(),
        args.keepalive_interval(),
        args.keepalive_idle(),
    );

    info!("MCP MySQL Server started and ready to accept requests");
    let result = serve(
        &mut session,
        BufReader::new(tokio::io::stdin()),
        &output,
        shutdown,
    )
    .await;

    keepalive.abort();
    debug!("Request loop ended in state {:?}", session.state());
    session.close().await;
    info!("MCP MySQL Server shutdown complete");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn session() -> Session {
        Session::new(PoolSettings::default(), QueryLimits::default(), None)
    }

    async fn reply(session: &mut Session, request: Value) -> Value {
        let line = serde_json::to_vec(&request).unwrap();
        let reply = session.handle_line(&line).await;
        serde_json::to_value(reply.response.expect("a response")).unwrap()
    }

    async fn initialized() -> Session {
        let mut session = session();
        reply(&mut session, json!({"jsonrpc": "2.0", "id": 0, "method": "initialize"})).await;
        session
    }

    #[tokio::test]
    async fn initialize_reports_server_info() {
        let mut session = session();
        assert_eq!(session.state(), State::Uninitialized);
        let response = reply(&mut session, json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"})).await;
        assert_eq!(response["id"], json!(1));
        assert_eq!(response["result"]["serverInfo"]["name"], json!(SERVER_NAME));
        assert_eq!(response["result"]["capabilities"]["tools"]["listChanged"], json!(false));
        assert_eq!(session.state(), State::Initialized);
    }

    #[tokio::test]
    async fn tool_calls_require_initialize() {
        let mut session = session();
        let response = reply(
            &mut session,
            json!({
                "jsonrpc": "2.0",
                "id": "call-1",
                "method": "MCP/callTool",
                "params": {"tool": "list_databases", "parameters": {}}
            }),
        )
        .await;
        assert_eq!(response["id"], json!("call-1"));
        assert_eq!(response["error"]["code"], json!(-32002));
        assert_eq!(response["error"]["message"], json!("Server not initialized"));
        assert!(response.get("result").is_none());
    }

    #[tokio::test]
    async fn tools_can_be_listed_before_initialize() {
        let mut session = session();
        let response = reply(&mut session, json!({"jsonrpc": "2.0", "id": 2, "method": "MCP/listTools"})).await;
        assert!(response["result"]["tools"]["execute_query"].is_object());
    }

    #[tokio::test]
    async fn unknown_tool_is_a_successful_rpc_result() {
        let mut session = initialized().await;
        let response = reply(
            &mut session,
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "MCP/callTool",
                "params": {"tool": "nope", "parameters": {}}
            }),
        )
        .await;
        assert_eq!(
            response,
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "result": {"success": false, "error": "Unknown tool: nope"}
            })
        );
    }

    #[tokio::test]
    async fn rejected_sql_is_a_tool_level_failure() {
        let mut session = initialized().await;
        let response = reply(
            &mut session,
            json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "MCP/callTool",
                "params": {"tool": "execute_query", "parameters": {"query": "SELECT 1; DROP TABLE x"}}
            }),
        )
        .await;
        assert_eq!(response["result"]["success"], json!(false));
        assert!(response["result"]["error"]
            .as_str()
            .unwrap()
            .contains("forbidden keyword: DROP"));
    }

    #[tokio::test]
    async fn malformed_call_params_are_invalid_params() {
        let mut session = initialized().await;
        let missing = reply(&mut session, json!({"jsonrpc": "2.0", "id": 5, "method": "MCP/callTool"})).await;
        assert_eq!(missing["error"]["code"], json!(-32602));

        let wrong = reply(
            &mut session,
            json!({"jsonrpc": "2.0", "id": 6, "method": "MCP/callTool", "params": {"parameters": {}}}),
        )
        .await;
        assert_eq!(wrong["error"]["code"], json!(-32602));
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let mut session = session();
        let response = reply(&mut session, json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"})).await;
        assert_eq!(response["error"]["code"], json!(-32601));
        assert_eq!(response["error"]["message"], json!("Method not found: tools/list"));
    }

    #[tokio::test]
    async fn parse_errors_have_null_id() {
        let mut session = session();
        let reply = session.handle_line(b"{\"jsonrpc\": \"2.0\", \"id\": 1,").await;
        let response = serde_json::to_value(reply.response.unwrap()).unwrap();
        assert_eq!(response["id"], Value::Null);
        assert_eq!(response["error"]["code"], json!(-32700));
        assert_eq!(reply.flow, Flow::Continue);
    }

    #[tokio::test]
    async fn non_request_json_is_invalid_request() {
        let mut session = session();
        let lines: [&[u8]; 3] = [b"[1, 2]", b"42", b"{\"method\": 7}"];
        for line in lines {
            let reply = session.handle_line(line).await;
            let response = serde_json::to_value(reply.response.unwrap()).unwrap();
            assert_eq!(response["id"], Value::Null);
            assert_eq!(response["error"]["code"], json!(-32600));
        }
    }

    #[tokio::test]
    async fn invalid_request_echoes_a_readable_id() {
        let mut session = session();
        let lines: [(&[u8], Value); 3] = [
            (b"{\"id\": 5, \"method\": 7}", json!(5)),
            (b"{\"id\": \"abc\"}", json!("abc")),
            (b"{\"id\": null, \"params\": []}", Value::Null),
        ];
        for (line, id) in lines {
            let reply = session.handle_line(line).await;
            let response = serde_json::to_value(reply.response.unwrap()).unwrap();
            assert_eq!(response["id"], id);
            assert_eq!(response["error"]["code"], json!(-32600));
        }
    }

    #[tokio::test]
    async fn ids_are_echoed_unchanged() {
        let mut session = session();
        for id in [json!(0), json!(-12), json!("abc"), json!(3.25), Value::Null] {
            let response = reply(
                &mut session,
                json!({"jsonrpc": "2.0", "id": id.clone(), "method": "MCP/listTools"}),
            )
            .await;
            assert_eq!(response["id"], id);
        }
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let mut session = session();
        for method in ["initialized", "MCP/listTools", "no/such/method"] {
            let line = serde_json::to_vec(&json!({"jsonrpc": "2.0", "method": method})).unwrap();
            let reply = session.handle_line(&line).await;
            assert!(reply.response.is_none(), "{method}");
            assert_eq!(reply.flow, Flow::Continue);
        }
    }

    #[tokio::test]
    async fn shutdown_then_exit_terminates() {
        let mut session = initialized().await;
        let response = reply(&mut session, json!({"jsonrpc": "2.0", "id": 8, "method": "shutdown"})).await;
        assert_eq!(response["result"], Value::Null);
        assert_eq!(session.state(), State::ShuttingDown);

        let reply = session.handle_line(br#"{"jsonrpc":"2.0","method":"exit"}"#).await;
        assert!(reply.response.is_none());
        assert_eq!(reply.flow, Flow::Exit);
        assert_eq!(session.state(), State::Terminated);
    }

    #[tokio::test]
    async fn initialize_fails_when_startup_target_is_unreachable() {
        let target = Target {
            host: "127.0.0.1".into(),
            port: 1,
            user: "nobody".into(),
            password: String::new(),
            database: None,
        };
        let mut session = Session::new(PoolSettings::default(), QueryLimits::default(), Some(target));
        let response = reply(&mut session, json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"})).await;
        assert_eq!(response["error"]["code"], json!(-32603));
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("Database connection failed"));
        assert_eq!(session.state(), State::Uninitialized);
    }

    #[tokio::test]
    async fn serve_keeps_going_after_bad_lines() {
        let mut session = session();
        let output = RpcWriter::new(Vec::new());
        let input: &[u8] = b"not json\n\n{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\"}\n\xff\xfe\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"MCP/callTool\",\"params\":{\"tool\":\"x\"}}\n";

        serve(&mut session, input, &output, std::future::pending()).await.unwrap();

        let sent = output.sent().await;
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0]["error"]["code"], json!(-32700));
        assert_eq!(sent[1]["id"], json!(1));
        assert_eq!(sent[2]["error"]["code"], json!(-32700));
        assert_eq!(sent[3]["result"]["error"], json!("Unknown tool: x"));
    }

    #[tokio::test]
    async fn serve_stops_at_exit() {
        let mut session = session();
        let output = RpcWriter::new(Vec::new());
        let input: &[u8] = b"{\"jsonrpc\":\"2.0\",\"method\":\"exit\"}\n{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"MCP/listTools\"}\n";

        serve(&mut session, input, &output, std::future::pending()).await.unwrap();

        assert!(output.sent().await.is_empty());
        assert_eq!(session.state(), State::Terminated);
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown_signal() {
        let mut session = session();
        let output = RpcWriter::new(Vec::new());
        let (_writer, reader) = tokio::io::duplex(64);

        serve(&mut session, BufReader::new(reader), &output, async {}).await.unwrap();

        assert!(output.sent().await.is_empty());
    }

    #[tokio::test]
    async fn activity_is_recorded_per_line() {
        let mut session = session();
        let clock = session.activity();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(clock.idle() >= Duration::from_millis(20));
        session.handle_line(b"{}").await;
        assert!(clock.idle() < Duration::from_millis(20));
    }
}
