//! Tools Module
//!
//! Each tool lives in its own module and exports a `register` function that
//! adds it to the registry during server initialization.

pub mod create_patient;

use std::sync::Arc;

use crate::core::config::Config;
use crate::core::server::ToolRegistry;

/// Register every tool the server exposes.
pub fn register_all(registry: &mut ToolRegistry, config: &Config) -> anyhow::Result<()> {
    let client = create_patient::ClinicClient::new(&config.clinic)?;
    if !config.clinic.uses_tls() {
        tracing::warn!(
            endpoint = %client.endpoint(),
            "clinic endpoint is not using TLS; secret keys will cross the network in cleartext"
        );
    }
    create_patient::register(registry, Arc::new(client));
    Ok(())
}
