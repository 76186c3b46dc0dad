//! Clinic MCP Server Entry Point
//!
//! Exposes the clinic `create_patient` operation as an MCP tool. The transport
//! is chosen from the first command-line argument, then MCP_TRANSPORT, then
//! defaults to streamable HTTP:
//!
//! ```text
//! clinic-mcp-server            # streamable-http at /mcp
//! clinic-mcp-server sse        # HTTP+SSE at /sse and /messages/
//! clinic-mcp-server stdio      # stdin/stdout, no HTTP listener
//! ```
//!
//! See `core::config` for the full list of environment variables.

mod core;
mod tools;

use crate::core::config::{Config, Transport};
use crate::core::server;

/// Route all logs to stderr so stdout stays reserved for the stdio transport.
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    let service = match server::initialize_service(&config) {
        Ok(service) => service,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize tools");
            std::process::exit(1);
        }
    };

    match config.transport {
        Transport::Stdio => server::run_server_stdio(service).await,
        Transport::Sse | Transport::StreamableHttp => server::run_server_http(config, service).await,
    }
}
