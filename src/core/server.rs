//! MCP Server Implementation
//!
//! This module contains the core MCP server implementation including:
//! - JSON-RPC 2.0 request/response structures
//! - Tool registry for managing available tools
//! - A single dispatcher shared by every transport
//! - HTTP application setup with Actix Web (diagnostic routes, CORS, MCP mount)
//! - STDIO server implementation for line-based communication

use actix_cors::Cors;
use actix_web::{
    App, HttpResponse, HttpServer, Result,
    http::header,
    middleware::{DefaultHeaders, Logger},
    web,
};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::core::config::{Config, CorsConfig, Transport};
use crate::core::sse::{self, SseSessions};
use crate::tools;

/// Protocol versions this server can speak. The first entry is the fallback
/// when a client asks for a version not listed here.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

/// JSON-RPC error codes used by the dispatcher.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
}

/// JSON-RPC 2.0 request structure for MCP protocol.
///
/// id is None for notifications, which never receive a response.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MCPRequest {
    /// JSON-RPC version identifier, must be "2.0"
    pub jsonrpc: String,
    /// Request ID for correlating responses. None indicates a notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// MCP method name (e.g., "initialize", "tools/list", "tools/call")
    pub method: String,
    /// Method-specific parameters as JSON value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl MCPRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response structure for MCP protocol.
///
/// Exactly one of result and error is present.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MCPResponse {
    /// JSON-RPC version identifier, always "2.0"
    pub jsonrpc: String,
    /// Request ID echoed from the request, None when it could not be read
    pub id: Option<Value>,
    /// Response result, present when request succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error information, present when request failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<MCPError>,
}

impl MCPResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(MCPError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC 2.0 error structure.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MCPError {
    /// JSON-RPC error code (see `error_codes`)
    pub code: i32,
    /// Human-readable error message
    pub message: String,
    /// Optional additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// MCP tool definition structure, serialized as-is for tools/list.
#[derive(Serialize, Debug, Clone)]
pub struct MCPTool {
    /// Unique tool identifier (e.g., "create_patient")
    pub name: String,
    /// Human-readable description of what the tool does
    pub description: String,
    /// JSON Schema defining the tool's input parameters
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Tool handler function type definition.
///
/// Handlers take the JSON arguments of a tools/call and resolve to the text
/// content of the result. An Err is reported as a tool result with
/// `isError: true`, never as a JSON-RPC error.
pub type ToolHandler = Box<dyn Fn(Value) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

/// Registry of available MCP tools.
pub struct ToolRegistry {
    /// Registered tools in registration order (for tools/list)
    pub tools: Vec<MCPTool>,
    /// Map of tool names to their handler functions (for tools/call)
    pub handlers: HashMap<String, ToolHandler>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    /// Register a tool with the registry.
    ///
    /// Registering a name twice replaces the earlier definition and handler.
    pub fn register(&mut self, tool: MCPTool, handler: ToolHandler) {
        let name = tool.name.clone();
        self.tools.retain(|t| t.name != name);
        self.tools.push(tool);
        self.handlers.insert(name, handler);
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport-independent MCP request dispatcher.
///
/// Owns the server metadata and the tool registry. One instance is built per
/// server and shared by reference with every transport.
pub struct McpService {
    pub server_name: String,
    pub server_version: String,
    pub registry: ToolRegistry,
}

impl McpService {
    pub fn new(server_name: String, server_version: String, registry: ToolRegistry) -> Self {
        Self {
            server_name,
            server_version,
            registry,
        }
    }

    /// Handle one JSON-RPC message.
    ///
    /// Returns None for notifications, which must not be answered.
    pub async fn handle(&self, req: MCPRequest) -> Option<MCPResponse> {
        if req.is_notification() {
            tracing::debug!(method = %req.method, "notification received");
            return None;
        }

        if req.jsonrpc != "2.0" {
            return Some(MCPResponse::failure(
                req.id,
                error_codes::INVALID_REQUEST,
                "Invalid Request: jsonrpc must be \"2.0\"",
            ));
        }

        let response = match req.method.as_str() {
            "initialize" => self.handle_initialize(req.id, req.params.as_ref()),
            "ping" => MCPResponse::success(req.id, serde_json::json!({})),
            "tools/list" => self.handle_tools_list(req.id),
            "tools/call" => self.handle_tools_call(req.id, req.params).await,
            _ => MCPResponse::failure(
                req.id,
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {}", req.method),
            ),
        };
        Some(response)
    }

    /// Parse and handle a raw JSON-RPC line or body.
    ///
    /// Text that is not JSON yields a parse error with no id. JSON that is not
    /// a request object yields an invalid request error carrying its id.
    pub async fn handle_raw(&self, raw: &str) -> Option<MCPResponse> {
        let value = match serde_json::from_str::<Value>(raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse JSON-RPC message");
                return Some(MCPResponse::failure(
                    None,
                    error_codes::PARSE_ERROR,
                    format!("Parse error: {}", e),
                ));
            }
        };

        let id = value.get("id").cloned();
        match serde_json::from_value::<MCPRequest>(value) {
            Ok(req) => self.handle(req).await,
            Err(e) => {
                tracing::warn!(error = %e, "malformed JSON-RPC request");
                Some(MCPResponse::failure(
                    id,
                    error_codes::INVALID_REQUEST,
                    format!("Invalid Request: {}", e),
                ))
            }
        }
    }

    fn handle_initialize(&self, id: Option<Value>, params: Option<&Value>) -> MCPResponse {
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let protocol_version = requested
            .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
            .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0]);

        MCPResponse::success(
            id,
            serde_json::json!({
                "protocolVersion": protocol_version,
                "capabilities": {
                    "tools": { "listChanged": false }
                },
                "serverInfo": {
                    "name": self.server_name,
                    "version": self.server_version
                }
            }),
        )
    }

    fn handle_tools_list(&self, id: Option<Value>) -> MCPResponse {
        MCPResponse::success(id, serde_json::json!({ "tools": self.registry.tools }))
    }

    async fn handle_tools_call(&self, id: Option<Value>, params: Option<Value>) -> MCPResponse {
        let Some(params) = params else {
            return MCPResponse::failure(id, error_codes::INVALID_PARAMS, "Invalid params");
        };

        let Some(tool_name) = params.get("name").and_then(Value::as_str) else {
            return MCPResponse::failure(
                id,
                error_codes::INVALID_PARAMS,
                "Invalid params: missing tool name",
            );
        };

        let Some(handler) = self.registry.handlers.get(tool_name) else {
            return MCPResponse::failure(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("Unknown tool: {}", tool_name),
            );
        };

        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));

        let (text, is_error) = match handler(arguments).await {
            Ok(text) => (text, false),
            Err(e) => {
                tracing::warn!(tool = tool_name, error = %e, "tool call rejected");
                (format!("Error executing tool {}: {}", tool_name, e), true)
            }
        };

        MCPResponse::success(
            id,
            serde_json::json!({
                "content": [
                    {
                        "type": "text",
                        "text": text
                    }
                ],
                "isError": is_error
            }),
        )
    }
}

/// Build the MCP service with every tool registered.
pub fn initialize_service(config: &Config) -> anyhow::Result<Arc<McpService>> {
    let mut registry = ToolRegistry::new();
    tools::register_all(&mut registry, config)?;
    Ok(Arc::new(McpService::new(
        config.server_name.clone(),
        config.server_version.clone(),
        registry,
    )))
}

/// Snapshot of the HTTP transport settings exposed by diagnostic routes.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub transport: Transport,
    pub mount_path: String,
}

/// Join a sub-path onto the mount path without doubling slashes.
pub fn mount_join(mount_path: &str, suffix: &str) -> String {
    format!("{}{}", mount_path.trim_end_matches('/'), suffix)
}

/// Health check endpoint handler.
///
/// Reports the active transport and mount path. Never touches the clinic
/// backend.
async fn health(settings: web::Data<HttpSettings>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "transport": settings.transport.as_str(),
        "mount": settings.mount_path
    })))
}

/// Root handler: redirect to the streamable-HTTP endpoint, or describe the
/// SSE endpoint.
async fn index(settings: web::Data<HttpSettings>) -> Result<HttpResponse> {
    match settings.transport {
        Transport::StreamableHttp if settings.mount_path != "/" => {
            Ok(HttpResponse::TemporaryRedirect()
                .insert_header((header::LOCATION, settings.mount_path.as_str()))
                .finish())
        }
        Transport::StreamableHttp => Ok(HttpResponse::Ok()
            .content_type("text/plain; charset=utf-8")
            .body("MCP server is running. Streamable HTTP endpoint is at /")),
        _ => Ok(HttpResponse::Ok()
            .content_type("text/plain; charset=utf-8")
            .body(format!(
                "MCP server is running. SSE endpoint is at {}",
                mount_join(&settings.mount_path, "/sse")
            ))),
    }
}

/// Streamable-HTTP endpoint: one JSON-RPC message per POST, answered with a
/// JSON body. Notifications are acknowledged with 202 and no body.
async fn streamable_http_post(
    service: web::Data<McpService>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let raw = match std::str::from_utf8(&body) {
        Ok(raw) => raw,
        Err(_) => {
            return Ok(HttpResponse::BadRequest().json(MCPResponse::failure(
                None,
                error_codes::PARSE_ERROR,
                "Parse error: body is not valid UTF-8",
            )));
        }
    };

    match service.handle_raw(raw).await {
        Some(response) => Ok(HttpResponse::Ok().json(response)),
        None => Ok(HttpResponse::Accepted().finish()),
    }
}

/// Server-initiated streams and session termination are not offered.
async fn streamable_http_method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed()
        .insert_header((header::ALLOW, "POST"))
        .finish()
}

/// Build the CORS middleware from configuration.
///
/// A "*" entry allows any origin; with credentials enabled the request origin
/// is echoed back instead of a literal wildcard.
pub fn build_cors(config: &CorsConfig) -> Cors {
    let mut cors = Cors::default()
        .allow_any_method()
        .allow_any_header()
        .max_age(600);

    if config.allows_any_origin() {
        cors = cors.allow_any_origin();
        if !config.allow_credentials {
            cors = cors.send_wildcard();
        }
    } else {
        for origin in &config.allow_origins {
            cors = cors.allowed_origin(origin);
        }
    }

    if config.allow_credentials {
        cors = cors.supports_credentials();
    }
    cors
}

/// Register the diagnostic routes and the transport handlers for the active
/// transport on an actix service config.
///
/// Shared by `run_server_http` and the route tests so both see the same app.
pub fn configure_routes(cfg: &mut web::ServiceConfig, settings: &HttpSettings) {
    cfg.route("/health", web::get().to(health))
        .route("/", web::get().to(index));

    match settings.transport {
        Transport::Sse => {
            cfg.route(
                &mount_join(&settings.mount_path, "/sse"),
                web::get().to(sse::sse_connect),
            )
            .route(
                &mount_join(&settings.mount_path, "/messages/"),
                web::post().to(sse::sse_message),
            );
        }
        _ => {
            cfg.service(
                web::resource(settings.mount_path.as_str())
                    .route(web::post().to(streamable_http_post))
                    .route(web::get().to(streamable_http_method_not_allowed))
                    .route(web::delete().to(streamable_http_method_not_allowed)),
            );
        }
    }
}

/// Run the MCP server over one of the HTTP transports.
///
/// # Configuration
/// The server is configured with:
/// - Worker threads: from config (CPU count, max 16, by default)
/// - Max connections: 10,000 concurrent connections
/// - Keep-alive: 30 seconds
/// - Request timeout: 30 seconds
/// - Shutdown timeout: 10 seconds
pub async fn run_server_http(config: Config, service: Arc<McpService>) -> std::io::Result<()> {
    let bind_addr = config.bind_addr();
    let settings = HttpSettings {
        transport: config.transport,
        mount_path: config.mount_path.clone(),
    };

    // Shared across workers; each worker gets a clone of the same Arc
    let service = web::Data::from(service);
    let sessions = web::Data::new(SseSessions::default());
    let settings_data = web::Data::new(settings.clone());
    let cors_config = config.cors.clone();

    tracing::info!(
        name = %config.server_name,
        version = %config.server_version,
        transport = %config.transport,
        mount = %config.mount_path,
        workers = config.workers,
        "Starting MCP server on http://{} ({} at {})",
        bind_addr,
        config.transport,
        config.mount_path
    );

    HttpServer::new(move || {
        App::new()
            .app_data(service.clone())
            .app_data(sessions.clone())
            .app_data(settings_data.clone())
            .wrap(
                DefaultHeaders::new()
                    .add(("X-Content-Type-Options", "nosniff"))
                    .add(("X-Frame-Options", "DENY")),
            )
            .wrap(build_cors(&cors_config))
            .wrap(Logger::new("%r %s %Dms"))
            .configure(|cfg| configure_routes(cfg, &settings))
    })
    .workers(config.workers)
    .max_connections(10000)
    .keep_alive(Duration::from_secs(30))
    .client_request_timeout(Duration::from_secs(30))
    .client_disconnect_timeout(Duration::from_secs(2))
    .shutdown_timeout(10)
    .bind(&bind_addr)?
    .run()
    .await
}

/// Run the MCP server in STDIO mode.
///
/// Reads newline-delimited JSON-RPC from stdin and writes responses to stdout.
/// All logging goes to stderr so the protocol stream stays clean. Returns when
/// stdin reaches EOF and every in-flight request has been answered.
pub async fn run_server_stdio(service: Arc<McpService>) -> std::io::Result<()> {
    tracing::info!(
        name = %service.server_name,
        version = %service.server_version,
        "Starting MCP server (stdio)"
    );

    let stdin = tokio::io::BufReader::with_capacity(8192, tokio::io::stdin());
    let stdout = tokio::io::BufWriter::with_capacity(8192, tokio::io::stdout());
    serve_lines(service, stdin, stdout).await?;

    tracing::info!("stdin closed, stdio session ended");
    Ok(())
}

/// Serve line-delimited JSON-RPC from `reader`, writing one response per line
/// to `writer`.
///
/// Every message is handled on its own task, so a tool call waiting on the
/// clinic backend does not hold up later messages. Responses are written in
/// completion order by a single writer.
pub async fn serve_lines<R, W>(service: Arc<McpService>, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut lines = reader.lines();

    let read_loop = async move {
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let service = Arc::clone(&service);
            let tx = tx.clone();
            tokio::spawn(async move {
                let Some(response) = service.handle_raw(&line).await else {
                    return;
                };
                match serde_json::to_string(&response) {
                    Ok(json) => {
                        let _ = tx.send(json);
                    }
                    Err(e) => tracing::error!(error = %e, "failed to serialize response"),
                }
            });
        }
        // The writer stops once this and every task's sender are gone
        drop(tx);
        Ok::<_, std::io::Error>(())
    };

    let write_loop = async {
        while let Some(json) = rx.recv().await {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    };

    tokio::try_join!(read_loop, write_loop)?;
    Ok(())
}
