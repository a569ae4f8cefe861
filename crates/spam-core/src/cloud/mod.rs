//! Backend registry: each remote backend is a named constructor for a
//! [`Connector`].

pub mod memory;
pub mod rest;

use std::sync::Arc;

use crate::api::Connector;
use crate::config::Config;
use crate::error::{Result, SpamError};
use crate::types::Credential;

pub use memory::MemoryCloud;
pub use rest::RestConnector;

/// Builds a connector from the config and the administrative credential.
pub type BackendFactory = fn(&Config, &Credential) -> Result<Arc<dyn Connector>>;

pub struct Backend {
    pub name: &'static str,
    pub description: &'static str,
    pub factory: BackendFactory,
}

fn memory_backend(config: &Config, admin: &Credential) -> Result<Arc<dyn Connector>> {
    Ok(Arc::new(MemoryCloud::seeded(
        admin,
        &config.admin_project,
        &config.base_image,
    )))
}

fn rest_backend(config: &Config, _admin: &Credential) -> Result<Arc<dyn Connector>> {
    Ok(Arc::new(RestConnector::new(config)))
}

pub fn backends() -> Vec<Backend> {
    vec![
        Backend {
            name: "memory",
            description: "in-process simulated cloud",
            factory: memory_backend,
        },
        Backend {
            name: "rest",
            description: "OpenStack-style JSON over HTTP",
            factory: rest_backend,
        },
    ]
}

/// Construct the connector named by `config.backend`.
pub fn connector(config: &Config, admin: &Credential) -> Result<Arc<dyn Connector>> {
    let backend = backends()
        .into_iter()
        .find(|b| b.name == config.backend)
        .ok_or_else(|| {
            let known: Vec<&str> = backends().iter().map(|b| b.name).collect();
            SpamError::MissingSetting(format!(
                "backend '{}' (known: {})",
                config.backend,
                known.join(", ")
            ))
        })?;
    (backend.factory)(config, admin)
}
