//! Server Configuration
//!
//! Resolves the transport, mount path, CORS policy and clinic backend settings
//! from the command line and environment variables. Resolution is done through
//! an env lookup closure so configurations can be built in tests without
//! touching the process environment.
//!
//! Environment Variables:
//! - PORT: Port number for HTTP transports (default: 8000)
//! - HOST: Bind address for HTTP transports (default: "0.0.0.0")
//! - WORKER_THREADS: actix worker count (default: CPU count, max 16)
//! - MCP_TRANSPORT: "stdio", "sse" or "streamable-http" (default: "streamable-http")
//! - MCP_MOUNT_PATH: Path the MCP endpoint is mounted at ("/mcp" or "/" by transport)
//! - MCP_CORS_ORIGINS: Comma-separated allowed origins (default: "*")
//! - MCP_CORS_ALLOW_CREDENTIALS: "true" to allow credentialed requests (default: false)
//! - CLINIC_API_URL: create-patient endpoint of the clinic backend
//! - CLINIC_SECRET_HEADER: also send the secret key as X-Secret-Key (default: true)
//! - CLINIC_TIMEOUT_SECS: Timeout for the clinic request (default: 10)

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_SERVER_NAME: &str = "healthco-mcp";
pub const DEFAULT_CLINIC_API_URL: &str = "http://49.50.66.74:5003/api/mcp/tools/create-patient";
pub const DEFAULT_CLINIC_TIMEOUT_SECS: u64 = 10;
pub const MAX_DEFAULT_WORKERS: usize = 16;

/// Fatal configuration problems detected before the server starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid transport '{0}'. Use one of: stdio | sse | streamable-http (default).")]
    InvalidTransport(String),

    #[error("Invalid {name} value '{value}': expected {expected}")]
    InvalidNumber {
        name: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("Invalid CORS origin '{0}': origins must be '*' or start with http:// or https://")]
    InvalidCorsOrigin(String),

    #[error("Invalid CLINIC_API_URL '{0}': must start with http:// or https://")]
    InvalidClinicUrl(String),
}

/// The MCP transport the process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Newline-delimited JSON-RPC over stdin/stdout, no HTTP listener
    Stdio,
    /// Legacy HTTP+SSE: event stream plus a message POST endpoint
    Sse,
    /// Streamable HTTP: JSON-RPC POSTed to a single endpoint
    StreamableHttp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Stdio => "stdio",
            Transport::Sse => "sse",
            Transport::StreamableHttp => "streamable-http",
        }
    }

    /// Mount path used when MCP_MOUNT_PATH is not set.
    pub fn default_mount_path(&self) -> &'static str {
        match self {
            Transport::StreamableHttp => "/mcp",
            Transport::Sse | Transport::Stdio => "/",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(Transport::Stdio),
            "sse" => Ok(Transport::Sse),
            "streamable-http" | "http" | "streamable" | "streamablehttp" => {
                Ok(Transport::StreamableHttp)
            }
            _ => Err(ConfigError::InvalidTransport(s.to_string())),
        }
    }
}

/// CORS policy applied to every route of the HTTP application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsConfig {
    pub allow_origins: Vec<String>,
    pub allow_credentials: bool,
}

impl CorsConfig {
    pub fn allows_any_origin(&self) -> bool {
        self.allow_origins.iter().any(|o| o == "*")
    }

    fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = lookup("MCP_CORS_ORIGINS").unwrap_or_else(|| "*".to_string());
        let allow_origins: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();

        if let Some(bad) = allow_origins
            .iter()
            .find(|o| *o != "*" && !o.starts_with("http://") && !o.starts_with("https://"))
        {
            return Err(ConfigError::InvalidCorsOrigin(bad.clone()));
        }

        Ok(Self {
            allow_origins,
            allow_credentials: flag(lookup, "MCP_CORS_ALLOW_CREDENTIALS", false),
        })
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origins: vec!["*".to_string()],
            allow_credentials: false,
        }
    }
}

/// Settings for the outbound call to the clinic backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClinicConfig {
    pub endpoint: String,
    /// Duplicate the secret key into the X-Secret-Key header
    pub send_secret_header: bool,
    pub timeout: Duration,
}

impl ClinicConfig {
    fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = non_empty(lookup, "CLINIC_API_URL")
            .unwrap_or_else(|| DEFAULT_CLINIC_API_URL.to_string());
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ConfigError::InvalidClinicUrl(endpoint));
        }

        let timeout_secs = match non_empty(lookup, "CLINIC_TIMEOUT_SECS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    return Err(ConfigError::InvalidNumber {
                        name: "CLINIC_TIMEOUT_SECS",
                        value: raw,
                        expected: "a positive number of seconds",
                    });
                }
            },
            None => DEFAULT_CLINIC_TIMEOUT_SECS,
        };

        Ok(Self {
            endpoint,
            send_secret_header: flag(lookup, "CLINIC_SECRET_HEADER", true),
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    pub fn uses_tls(&self) -> bool {
        self.endpoint.starts_with("https://")
    }
}

impl Default for ClinicConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_CLINIC_API_URL.to_string(),
            send_secret_header: true,
            timeout: Duration::from_secs(DEFAULT_CLINIC_TIMEOUT_SECS),
        }
    }
}

/// Fully resolved process configuration.
///
/// Built once in `main` and passed down to the server; nothing here is global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub server_name: String,
    pub server_version: String,
    pub transport: Transport,
    /// Always starts with '/'
    pub mount_path: String,
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub cors: CorsConfig,
    pub clinic: ClinicConfig,
}

impl Config {
    /// Resolve configuration from the real command line and environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_sources(std::env::args().skip(1), |key| std::env::var(key).ok())
    }

    /// Resolve configuration from explicit sources.
    ///
    /// `args` are the command-line arguments without the program name. The
    /// first one, when present, selects the transport and takes precedence
    /// over MCP_TRANSPORT.
    pub fn from_sources<I, F>(args: I, lookup: F) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
        F: Fn(&str) -> Option<String>,
    {
        let arg_transport = args.into_iter().next();
        let transport = match arg_transport.or_else(|| non_empty(&lookup, "MCP_TRANSPORT")) {
            Some(token) => token.parse::<Transport>()?,
            None => Transport::StreamableHttp,
        };

        let mount_path = normalize_mount_path(
            &lookup("MCP_MOUNT_PATH").unwrap_or_else(|| transport.default_mount_path().to_string()),
        );

        let port = match non_empty(&lookup, "PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| ConfigError::InvalidNumber {
                name: "PORT",
                value: raw,
                expected: "a port number between 0 and 65535",
            })?,
            None => DEFAULT_PORT,
        };

        // Defaults to CPU count but capped at 16 to avoid excessive context switching
        let workers = match non_empty(&lookup, "WORKER_THREADS") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidNumber {
                        name: "WORKER_THREADS",
                        value: raw,
                        expected: "a positive integer",
                    });
                }
            },
            None => num_cpus::get().clamp(1, MAX_DEFAULT_WORKERS),
        };

        Ok(Self {
            server_name: non_empty(&lookup, "SERVER_NAME")
                .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string()),
            server_version: non_empty(&lookup, "SERVER_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            transport,
            mount_path,
            host: non_empty(&lookup, "HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            workers,
            cors: CorsConfig::from_lookup(&lookup)?,
            clinic: ClinicConfig::from_lookup(&lookup)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Prefix a mount path with '/' when it lacks one. An empty path becomes "/".
pub fn normalize_mount_path(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn flag<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, key) {
        Some(v) => v.trim().eq_ignore_ascii_case("true"),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(args: &[&str], env: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_sources(args.iter().map(|a| a.to_string()), move |key| {
            env.get(key).cloned()
        })
    }

    #[test]
    fn test_defaults_to_streamable_http_at_mcp() {
        let config = resolve(&[], &[]).unwrap();
        assert_eq!(config.transport, Transport::StreamableHttp);
        assert_eq!(config.mount_path, "/mcp");
        assert_eq!(config.port, 8000);
        assert_eq!(config.bind_addr(), "0.0.0.0:8000");
        assert_eq!(config.server_name, "healthco-mcp");
        assert_eq!(config.cors, CorsConfig::default());
        assert_eq!(config.clinic, ClinicConfig::default());
    }

    #[test]
    fn test_cli_stdio_argument() {
        let config = resolve(&["stdio"], &[("MCP_TRANSPORT", "sse")]).unwrap();
        assert_eq!(config.transport, Transport::Stdio);
    }

    #[test]
    fn test_cli_argument_overrides_env() {
        let config = resolve(&["HTTP"], &[("MCP_TRANSPORT", "sse")]).unwrap();
        assert_eq!(config.transport, Transport::StreamableHttp);
        assert_eq!(config.mount_path, "/mcp");
    }

    #[test]
    fn test_env_sse_mounts_at_root() {
        let config = resolve(&[], &[("MCP_TRANSPORT", "sse")]).unwrap();
        assert_eq!(config.transport, Transport::Sse);
        assert_eq!(config.mount_path, "/");
    }

    #[test]
    fn test_empty_env_transport_is_unset() {
        let config = resolve(&[], &[("MCP_TRANSPORT", "")]).unwrap();
        assert_eq!(config.transport, Transport::StreamableHttp);
    }

    #[test]
    fn test_transport_aliases() {
        for token in ["http", "streamable", "StreamableHTTP", "streamable-http"] {
            assert_eq!(token.parse::<Transport>().unwrap(), Transport::StreamableHttp);
        }
        assert_eq!("SSE".parse::<Transport>().unwrap(), Transport::Sse);
    }

    #[test]
    fn test_unknown_transport_is_fatal() {
        let err = resolve(&["websocket"], &[]).unwrap_err();
        assert_eq!(err, ConfigError::InvalidTransport("websocket".to_string()));
        assert!(err.to_string().contains("stdio | sse | streamable-http"));

        let err = resolve(&[], &[("MCP_TRANSPORT", "grpc")]).unwrap_err();
        assert_eq!(err, ConfigError::InvalidTransport("grpc".to_string()));
    }

    #[test]
    fn test_mount_path_gets_leading_slash() {
        let config = resolve(&[], &[("MCP_MOUNT_PATH", "api/mcp")]).unwrap();
        assert_eq!(config.mount_path, "/api/mcp");
        assert_eq!(normalize_mount_path(""), "/");
    }

    #[test]
    fn test_invalid_port_is_fatal() {
        let err = resolve(&[], &[("PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { name: "PORT", .. }));
    }

    #[test]
    fn test_cors_origins_are_trimmed() {
        let config = resolve(
            &[],
            &[
                ("MCP_CORS_ORIGINS", " https://a.example , ,http://b.example "),
                ("MCP_CORS_ALLOW_CREDENTIALS", "TRUE"),
            ],
        )
        .unwrap();
        assert_eq!(
            config.cors.allow_origins,
            vec!["https://a.example".to_string(), "http://b.example".to_string()]
        );
        assert!(config.cors.allow_credentials);
        assert!(!config.cors.allows_any_origin());
    }

    #[test]
    fn test_cors_rejects_bare_hostnames() {
        let err = resolve(&[], &[("MCP_CORS_ORIGINS", "example.com")]).unwrap_err();
        assert_eq!(err, ConfigError::InvalidCorsOrigin("example.com".to_string()));
    }

    #[test]
    fn test_clinic_settings() {
        let config = resolve(
            &[],
            &[
                ("CLINIC_API_URL", "https://clinic.example/api/mcp/tools/create-patient"),
                ("CLINIC_SECRET_HEADER", "false"),
                ("CLINIC_TIMEOUT_SECS", "3"),
            ],
        )
        .unwrap();
        assert!(config.clinic.uses_tls());
        assert!(!config.clinic.send_secret_header);
        assert_eq!(config.clinic.timeout, Duration::from_secs(3));

        let err = resolve(&[], &[("CLINIC_TIMEOUT_SECS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { name: "CLINIC_TIMEOUT_SECS", .. }));
    }
}
