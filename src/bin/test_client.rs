//! MCP Test Client
//!
//! Connects to a running clinic MCP server over HTTP+SSE or streamable HTTP,
//! initializes a session, lists the available tools and optionally calls
//! `create_patient`.
//!
//! ```text
//! test-client                                   # http://localhost:8000/sse
//! test-client http://localhost:8000/mcp         # streamable HTTP
//! test-client http://localhost:8000/mcp --call --name "Test User" \
//!     --phone 1234567890 --secret-key "$CLINIC_SECRET_KEY"
//! ```

use anyhow::{Context, anyhow, bail};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use futures_util::{Stream, StreamExt};
use reqwest::Url;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{Value, json};
use std::pin::Pin;
use std::process::ExitCode;
use std::time::Duration;

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION: &str = "2024-11-05";
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Connect to the clinic MCP server, list its tools and optionally call create_patient"
)]
struct Args {
    /// Server URL: the SSE endpoint (".../sse") or the streamable HTTP mount (".../mcp")
    #[arg(env = "MCP_SERVER_URL", default_value = "http://localhost:8000/sse")]
    url: String,

    /// Transport to use; inferred from the URL when omitted
    #[arg(long, value_enum)]
    transport: Option<ClientTransport>,

    /// Call create_patient after listing tools
    #[arg(long)]
    call: bool,

    #[arg(long, default_value = "Test User")]
    name: String,

    #[arg(long, default_value = "1234567890")]
    phone: String,

    #[arg(long, env = "CLINIC_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    #[arg(long)]
    email: Option<String>,

    #[arg(long)]
    date_of_birth: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ClientTransport {
    Sse,
    #[value(name = "streamable-http", alias = "http")]
    StreamableHttp,
}

impl ClientTransport {
    /// SSE when the URL path ends in "/sse", streamable HTTP otherwise.
    fn infer(url: &Url) -> Self {
        if url.path().trim_end_matches('/').ends_with("/sse") {
            ClientTransport::Sse
        } else {
            ClientTransport::StreamableHttp
        }
    }
}

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SseEvent {
    event: String,
    data: String,
}

/// Incremental parser for `text/event-stream` bodies.
///
/// Buffers raw bytes and only decodes complete frames, so a chunk boundary
/// inside a multi-byte character or a CRLF pair does not corrupt the event.
#[derive(Debug, Default)]
struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    /// Feed a chunk and return every event it completes.
    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|&b| b != b'\r'));
        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_frame(&String::from_utf8_lossy(&frame)) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_frame(frame: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in frame.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }
    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}

fn rpc_request(id: i64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

/// Extract the result of a JSON-RPC response, turning an error member into Err.
fn rpc_result(response: Value) -> anyhow::Result<Value> {
    if let Some(error) = response.get("error") {
        bail!(
            "server returned error {}: {}",
            error.get("code").cloned().unwrap_or(Value::Null),
            error.get("message").and_then(Value::as_str).unwrap_or("unknown error")
        );
    }
    response
        .get("result")
        .cloned()
        .ok_or_else(|| anyhow!("response has neither result nor error: {}", response))
}

trait McpSession {
    async fn request(&mut self, method: &str, params: Value) -> anyhow::Result<Value>;
    async fn notify(&mut self, method: &str) -> anyhow::Result<()>;
}

/// Streamable HTTP: every message is its own POST to the mount URL.
struct StreamableSession {
    http: reqwest::Client,
    url: Url,
    session_id: Option<String>,
    next_id: i64,
}

impl StreamableSession {
    fn new(http: reqwest::Client, url: Url) -> Self {
        Self {
            http,
            url,
            session_id: None,
            next_id: 1,
        }
    }

    async fn post(&mut self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let mut builder = self
            .http
            .post(self.url.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session_id) = &self.session_id {
            builder = builder.header(SESSION_HEADER, session_id);
        }
        let response = builder.send().await.context("request failed")?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("server answered {}: {}", status, text);
        }
        Ok(response)
    }
}

impl McpSession for StreamableSession {
    async fn request(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        let response = self.post(&rpc_request(id, method, params)).await?;

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));
        let text = response.text().await.context("failed to read response")?;

        let message: Value = if is_stream {
            let mut parser = SseParser::default();
            let mut events = parser.push(text.as_bytes());
            events.extend(parser.push(b"\n\n"));
            events
                .into_iter()
                .filter(|e| e.event == "message")
                .filter_map(|e| serde_json::from_str::<Value>(&e.data).ok())
                .find(|v| v.get("id") == Some(&json!(id)))
                .ok_or_else(|| anyhow!("no response for request {} in event stream", id))?
        } else {
            serde_json::from_str(&text).with_context(|| format!("invalid JSON response: {}", text))?
        };
        rpc_result(message)
    }

    async fn notify(&mut self, method: &str) -> anyhow::Result<()> {
        self.post(&json!({ "jsonrpc": "2.0", "method": method })).await?;
        Ok(())
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// HTTP+SSE: responses arrive on a long-lived event stream, requests are
/// POSTed to the endpoint the server announces.
struct SseSession {
    http: reqwest::Client,
    message_url: Url,
    stream: ByteStream,
    parser: SseParser,
    pending: Vec<SseEvent>,
    next_id: i64,
}

impl SseSession {
    async fn connect(http: reqwest::Client, url: Url) -> anyhow::Result<Self> {
        let response = http
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .context("failed to open SSE stream")?;
        if !response.status().is_success() {
            bail!("server answered {} to SSE connect", response.status());
        }

        let mut session = Self {
            http,
            message_url: url.clone(),
            stream: Box::pin(response.bytes_stream()),
            parser: SseParser::default(),
            pending: Vec::new(),
            next_id: 1,
        };

        let endpoint = session.next_event_named("endpoint").await?;
        session.message_url = url
            .join(endpoint.data.trim())
            .with_context(|| format!("invalid endpoint event: {}", endpoint.data))?;
        Ok(session)
    }

    async fn next_event(&mut self) -> anyhow::Result<SseEvent> {
        loop {
            if !self.pending.is_empty() {
                return Ok(self.pending.remove(0));
            }
            let chunk = tokio::time::timeout(RESPONSE_TIMEOUT, self.stream.next())
                .await
                .context("timed out waiting for server event")?
                .ok_or_else(|| anyhow!("SSE stream closed by server"))?
                .context("SSE stream failed")?;
            self.pending.extend(self.parser.push(&chunk));
        }
    }

    async fn next_event_named(&mut self, name: &str) -> anyhow::Result<SseEvent> {
        loop {
            let event = self.next_event().await?;
            if event.event == name {
                return Ok(event);
            }
        }
    }

    async fn post(&self, body: &Value) -> anyhow::Result<()> {
        let response = self
            .http
            .post(self.message_url.clone())
            .json(body)
            .send()
            .await
            .context("failed to post message")?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("server answered {}: {}", status, text);
        }
        Ok(())
    }
}

impl McpSession for SseSession {
    async fn request(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        self.post(&rpc_request(id, method, params)).await?;

        loop {
            let event = self.next_event_named("message").await?;
            let Ok(message) = serde_json::from_str::<Value>(&event.data) else {
                continue;
            };
            if message.get("id") == Some(&json!(id)) {
                return rpc_result(message);
            }
        }
    }

    async fn notify(&mut self, method: &str) -> anyhow::Result<()> {
        self.post(&json!({ "jsonrpc": "2.0", "method": method })).await
    }
}

fn tool_arguments(args: &Args) -> anyhow::Result<Value> {
    let secret_key = args
        .secret_key
        .as_deref()
        .ok_or_else(|| anyhow!("--secret-key (or CLINIC_SECRET_KEY) is required with --call"))?;
    let mut arguments = json!({
        "name": args.name,
        "phone": args.phone,
        "secretKey": secret_key,
    });
    if let Some(email) = &args.email {
        arguments["email"] = json!(email);
    }
    if let Some(date_of_birth) = &args.date_of_birth {
        arguments["dateOfBirth"] = json!(date_of_birth);
    }
    Ok(arguments)
}

async fn exercise<S: McpSession>(session: &mut S, args: &Args) -> anyhow::Result<()> {
    println!("Initializing session...");
    let init = session
        .request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": "clinic-mcp-test-client", "version": env!("CARGO_PKG_VERSION") }
            }),
        )
        .await?;
    session.notify("notifications/initialized").await?;
    println!(
        "Session initialized ({} {}).",
        init["serverInfo"]["name"].as_str().unwrap_or("unknown server"),
        init["serverInfo"]["version"].as_str().unwrap_or("")
    );

    println!("Listing tools...");
    let listed = session.request("tools/list", json!({})).await?;
    let tools = listed["tools"].as_array().cloned().unwrap_or_default();
    println!("\nFound {} tools:", tools.len());
    for tool in &tools {
        println!(
            "- {}: {}",
            tool["name"].as_str().unwrap_or("?"),
            tool["description"].as_str().unwrap_or("")
        );
        println!("  Schema: {}", tool["inputSchema"]);
    }

    if args.call {
        println!("\nTesting create_patient tool...");
        let result = session
            .request(
                "tools/call",
                json!({ "name": "create_patient", "arguments": tool_arguments(args)? }),
            )
            .await?;
        for content in result["content"].as_array().into_iter().flatten() {
            if let Some(text) = content["text"].as_str() {
                println!("Result: {}", text);
            }
        }
        if result["isError"].as_bool().unwrap_or(false) {
            println!("(tool reported an error)");
        }
    }
    Ok(())
}

async fn run(args: &Args) -> anyhow::Result<()> {
    let url = Url::parse(&args.url).with_context(|| format!("invalid server URL '{}'", args.url))?;
    let transport = args.transport.unwrap_or_else(|| ClientTransport::infer(&url));
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    println!("Connecting to {} ({:?})...", url, transport);
    match transport {
        ClientTransport::Sse => {
            let mut session = SseSession::connect(http, url).await?;
            println!("Connected to SSE endpoint.");
            exercise(&mut session, args).await
        }
        ClientTransport::StreamableHttp => {
            let mut session = StreamableSession::new(http, url);
            exercise(&mut session, args).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\nError: {:#}", e);
            eprintln!("Make sure the server is running and the URL is correct.");
            ExitCode::FAILURE
        }
    }
}
