use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use crate::api::{Cloud, Connector};
use crate::cloud::MemoryCloud;
use crate::config::{seed_from_vars, Config, Settings};
use crate::keeper::Keeper;
use crate::store::ResourceStore;
use crate::types::Credential;

pub const AUTH_URL: &str = "memory://keystone/v3";

pub fn admin_credential() -> Credential {
    Credential {
        username: "admin".into(),
        password: "secret".into(),
        project_name: "admin".into(),
        user_domain_id: "default".into(),
        project_domain_id: "default".into(),
        auth_url: AUTH_URL.into(),
        created_at: Utc::now(),
    }
}

pub fn admin_vars() -> Vec<(String, String)> {
    [
        ("OS_USERNAME", "admin"),
        ("OS_PASSWORD", "secret"),
        ("OS_PROJECT_NAME", "admin"),
        ("OS_AUTH_URL", AUTH_URL),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// A seeded store, a simulated cloud and a keeper acting as admin.
pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<ResourceStore>,
    pub cloud: MemoryCloud,
    pub admin: Arc<dyn Cloud>,
    pub keeper: Arc<Keeper>,
}

impl Fixture {
    /// Everything wired up, but `bootstrap` not yet run.
    pub fn unbooted() -> Self {
        Self::with_config(Config {
            backend: "memory".into(),
            ..Config::default()
        })
    }

    pub fn with_config(config: Config) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            ResourceStore::open_with(&dir.path().join("spam.redb"), || {
                seed_from_vars(admin_vars())
            })
            .unwrap(),
        );
        let cloud = MemoryCloud::seeded(&admin_credential(), "admin", &config.base_image);
        let admin = cloud.connect(&admin_credential()).unwrap();
        let settings = Settings::load(&store).unwrap();
        let keeper = Arc::new(Keeper::new(store.clone(), admin.clone(), config, settings));
        Self {
            dir,
            store,
            cloud,
            admin,
            keeper,
        }
    }

    /// Bootstrapped fixture.
    pub fn new() -> Self {
        let fixture = Self::unbooted();
        fixture.keeper.bootstrap().unwrap();
        fixture
    }
}
