use crate::error::{Result, SpamError};
use crate::store::{Record, ResourceStore, Seed};
use crate::types::{Collection, Credential, Namespace};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Runtime configuration, read from an optional YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name of the remote backend in the backend registry.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Base URL per collection. Identity falls back to the seeded auth URL.
    #[serde(default)]
    pub endpoints: BTreeMap<Collection, String>,
    /// Image that must survive cleanup.
    #[serde(default = "default_base_image")]
    pub base_image: String,
    #[serde(default = "default_admin_project")]
    pub admin_project: String,
    /// Value written to every quota key of a new project.
    #[serde(default = "default_quota_limit")]
    pub quota_limit: i64,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_backend() -> String {
    "rest".to_string()
}

fn default_base_image() -> String {
    "cirros-0.3.4-x86_64-uec".to_string()
}

fn default_admin_project() -> String {
    "admin".to_string()
}

fn default_quota_limit() -> i64 {
    -1
}

fn default_name_prefix() -> String {
    "spam".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            endpoints: BTreeMap::new(),
            base_image: default_base_image(),
            admin_project: default_admin_project(),
            quota_limit: default_quota_limit(),
            name_prefix: default_name_prefix(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Config {
    /// Load from `path`, or return defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let data = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&data)?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Bootstrap seed
// ---------------------------------------------------------------------------

pub const AUTH_URL: &str = "auth_url";
pub const ADMIN_USER: &str = "admin_user";

/// Build the one-time store seed from `OS_*` variables: the administrative
/// credential plus auth URL and per-service API versions.
pub fn seed_from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Seed> {
    let vars: HashMap<String, String> = vars.into_iter().collect();
    let required = |key: &str| {
        vars.get(key)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| SpamError::MissingSetting(key.to_string()))
    };
    let optional = |key: &str| {
        vars.get(key)
            .cloned()
            .unwrap_or_else(|| "default".to_string())
    };

    let username = required("OS_USERNAME")?;
    let auth_url = required("OS_AUTH_URL")?;
    let credential = Credential {
        username: username.clone(),
        password: required("OS_PASSWORD")?,
        project_name: required("OS_PROJECT_NAME")?,
        user_domain_id: optional("OS_USER_DOMAIN_ID"),
        project_domain_id: optional("OS_PROJECT_DOMAIN_ID"),
        auth_url: auth_url.clone(),
        created_at: Utc::now(),
    };

    let mut seed = Seed::default();
    seed.push(Namespace::credentials(), &username, Record::Credential(credential));
    seed.push(
        Namespace::settings(),
        AUTH_URL,
        Record::Setting { value: auth_url },
    );
    seed.push(
        Namespace::settings(),
        ADMIN_USER,
        Record::Setting { value: username },
    );
    for (key, value) in &vars {
        if let Some(service) = key
            .strip_prefix("OS_")
            .and_then(|k| k.strip_suffix("_API_VERSION"))
        {
            seed.push(
                Namespace::settings(),
                format!("{}_api_version", service.to_lowercase()),
                Record::Setting {
                    value: value.clone(),
                },
            );
        }
    }
    Ok(seed)
}

pub fn seed_from_env() -> Result<Seed> {
    seed_from_vars(std::env::vars())
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Bootstrap settings as persisted in the store.
#[derive(Debug, Clone)]
pub struct Settings {
    pub auth_url: String,
    pub admin_user: String,
    pub api_versions: BTreeMap<String, String>,
}

impl Settings {
    pub fn load(store: &ResourceStore) -> Result<Self> {
        let mut auth_url = None;
        let mut admin_user = None;
        let mut api_versions = BTreeMap::new();
        for (key, record) in store.entries(&Namespace::settings())? {
            let Some(value) = record.as_setting() else {
                continue;
            };
            match key.as_str() {
                AUTH_URL => auth_url = Some(value.to_string()),
                ADMIN_USER => admin_user = Some(value.to_string()),
                other => {
                    if let Some(service) = other.strip_suffix("_api_version") {
                        api_versions.insert(service.to_string(), value.to_string());
                    }
                }
            }
        }
        Ok(Self {
            auth_url: auth_url.ok_or_else(|| SpamError::MissingSetting(AUTH_URL.into()))?,
            admin_user: admin_user.ok_or_else(|| SpamError::MissingSetting(ADMIN_USER.into()))?,
            api_versions,
        })
    }

    /// The administrative credential record.
    pub fn admin_credential(&self, store: &ResourceStore) -> Result<Credential> {
        store
            .get(&Namespace::credentials(), &self.admin_user)?
            .as_credential()
            .cloned()
            .ok_or_else(|| SpamError::MissingSetting(format!("credential for {}", self.admin_user)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
