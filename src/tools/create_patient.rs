//! create_patient Tool
//!
//! Forwards a patient registration to the clinic backend as a single JSON POST
//! and reports the outcome as human-readable text. Backend rejections and
//! transport failures are part of the text result; the tool call itself
//! always succeeds at the protocol level once the arguments are valid.

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::core::config::ClinicConfig;
use crate::core::server::{MCPTool, ToolHandler, ToolRegistry};

pub const TOOL_NAME: &str = "create_patient";

/// Header carrying a copy of the secret key for backends that authenticate by header.
pub const SECRET_KEY_HEADER: &str = "X-Secret-Key";

/// Arguments of a create_patient call, as sent by the MCP client.
#[derive(Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatientCreationRequest {
    pub name: String,
    pub phone: String,
    pub secret_key: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
}

// Hand-written so the secret key can never end up in a log line
impl fmt::Debug for PatientCreationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatientCreationRequest")
            .field("name", &self.name)
            .field("phone", &self.phone)
            .field("secret_key", &"<redacted>")
            .field("email", &self.email)
            .field("date_of_birth", &self.date_of_birth)
            .finish()
    }
}

/// Reasons a create_patient call is rejected before reaching the backend.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("invalid arguments: {0}")]
    Malformed(String),

    #[error("'{0}' must not be empty")]
    Empty(&'static str),
}

impl PatientCreationRequest {
    /// Deserialize and validate tool arguments.
    pub fn from_arguments(args: Value) -> Result<Self, ArgumentError> {
        let request: Self =
            serde_json::from_value(args).map_err(|e| ArgumentError::Malformed(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    fn validate(&self) -> Result<(), ArgumentError> {
        if self.name.is_empty() {
            return Err(ArgumentError::Empty("name"));
        }
        if self.phone.is_empty() {
            return Err(ArgumentError::Empty("phone"));
        }
        if self.secret_key.is_empty() {
            return Err(ArgumentError::Empty("secretKey"));
        }
        Ok(())
    }

    /// Body sent to the backend. Absent and empty optional fields are omitted.
    pub fn payload(&self) -> CreatePatientPayload<'_> {
        CreatePatientPayload {
            name: &self.name,
            phone: &self.phone,
            secret_key: &self.secret_key,
            email: self.email.as_deref().filter(|s| !s.is_empty()),
            date_of_birth: self.date_of_birth.as_deref().filter(|s| !s.is_empty()),
        }
    }
}

/// Wire shape of the backend request body.
#[derive(Serialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CreatePatientPayload<'a> {
    pub name: &'a str,
    pub phone: &'a str,
    pub secret_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<&'a str>,
}

/// Result of one create_patient call. Rendered to text with `Display`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreatePatientOutcome {
    /// 2xx from the backend, with its raw body
    Created(String),
    /// Any other status, with the raw body
    Rejected { status: u16, body: String },
    /// No usable response: connect, DNS, timeout or body read failure
    Failed(String),
}

impl fmt::Display for CreatePatientOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreatePatientOutcome::Created(body) => {
                write!(f, "Successfully created patient: {}", body)
            }
            CreatePatientOutcome::Rejected { status, body } => {
                write!(f, "Failed to create patient. Status: {}, Error: {}", status, body)
            }
            CreatePatientOutcome::Failed(message) => write!(f, "An error occurred: {}", message),
        }
    }
}

/// HTTP client for the clinic backend's create-patient endpoint.
pub struct ClinicClient {
    http: reqwest::Client,
    endpoint: String,
    send_secret_header: bool,
}

impl ClinicClient {
    pub fn new(config: &ClinicConfig) -> Result<Self, reqwest::Error> {
        // Redirects are reported as failures rather than replayed
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            send_secret_header: config.send_secret_header,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Issue exactly one POST for the request. Never retries.
    pub async fn create_patient(&self, request: &PatientCreationRequest) -> CreatePatientOutcome {
        let started = Instant::now();
        let mut builder = self.http.post(&self.endpoint).json(&request.payload());
        if self.send_secret_header {
            builder = builder.header(SECRET_KEY_HEADER, &request.secret_key);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                let message = error_chain(e);
                tracing::warn!(endpoint = %self.endpoint, error = %message, "clinic request failed");
                return CreatePatientOutcome::Failed(message);
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                let message = error_chain(e);
                tracing::warn!(endpoint = %self.endpoint, status = status.as_u16(), error = %message, "failed to read clinic response");
                return CreatePatientOutcome::Failed(message);
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if status.is_success() {
            tracing::info!(status = status.as_u16(), elapsed_ms, "patient created");
            CreatePatientOutcome::Created(body)
        } else {
            tracing::warn!(status = status.as_u16(), elapsed_ms, "clinic rejected patient");
            CreatePatientOutcome::Rejected {
                status: status.as_u16(),
                body,
            }
        }
    }
}

/// Render an error with its sources, e.g. "error sending request for url
/// (...): client error (Connect): tcp connect error: Connection refused".
fn error_chain(e: reqwest::Error) -> String {
    format!("{:#}", anyhow::Error::new(e))
}

/// MCP definition of the tool, including its argument schema.
pub fn definition() -> MCPTool {
    MCPTool {
        name: TOOL_NAME.to_string(),
        description: "Create a new patient in the clinic system.\n\n\
            Args:\n    \
            name: The name of the patient.\n    \
            phone: The phone number of the patient.\n    \
            secretKey: The secret key for authentication.\n    \
            email: The email of the patient.\n    \
            dateOfBirth: The date of birth of the patient."
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "minLength": 1,
                    "description": "The name of the patient"
                },
                "phone": {
                    "type": "string",
                    "minLength": 1,
                    "description": "The phone number of the patient"
                },
                "secretKey": {
                    "type": "string",
                    "minLength": 1,
                    "description": "The secret key for authentication"
                },
                "email": {
                    "type": ["string", "null"],
                    "description": "The email of the patient"
                },
                "dateOfBirth": {
                    "type": ["string", "null"],
                    "description": "The date of birth of the patient"
                }
            },
            "required": ["name", "phone", "secretKey"]
        }),
    }
}

/// Register the create_patient tool backed by the given client.
pub fn register(registry: &mut ToolRegistry, client: Arc<ClinicClient>) {
    let handler: ToolHandler = Box::new(move |args: Value| {
        let client = Arc::clone(&client);
        async move {
            let request = PatientCreationRequest::from_arguments(args).map_err(|e| e.to_string())?;
            Ok::<_, String>(client.create_patient(&request).await.to_string())
        }
        .boxed()
    });

    registry.register(definition(), handler);
}
