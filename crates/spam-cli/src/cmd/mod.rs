pub mod clean;
pub mod pipeline;
pub mod run;
pub mod store;

use anyhow::{Context, Result};
use spam_core::api::Connector;
use spam_core::cloud;
use spam_core::config::{seed_from_env, Config, Settings};
use spam_core::keeper::Keeper;
use spam_core::store::ResourceStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Global options every command shares.
pub struct Env {
    pub db: PathBuf,
    pub config: Option<PathBuf>,
    pub backend: Option<String>,
}

/// A bootstrapped keeper plus the connector branches open sessions with.
pub struct Wired {
    pub keeper: Arc<Keeper>,
    pub connector: Arc<dyn Connector>,
}

impl Env {
    pub fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(Some(path))
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(backend) = &self.backend {
            config.backend = backend.clone();
        }
        Ok(config)
    }

    /// Open the store without seeding it.
    pub fn open_store(&self) -> Result<ResourceStore> {
        ResourceStore::open(&self.db)
            .with_context(|| format!("failed to open store {}", self.db.display()))
    }

    /// Open (and on first use seed) the store, log in as the administrative
    /// principal and bootstrap the keeper.
    pub fn wire(&self) -> Result<Wired> {
        let config = self.config()?;
        let store = Arc::new(
            ResourceStore::open_with(&self.db, seed_from_env)
                .with_context(|| format!("failed to open store {}", self.db.display()))?,
        );
        let settings = Settings::load(&store).context("store holds no bootstrap settings")?;
        let admin = settings.admin_credential(&store)?;

        let connector = cloud::connector(&config, &admin)?;
        let session = connector
            .connect(&admin)
            .with_context(|| format!("admin login as '{}' failed", admin.username))?;

        let keeper = Arc::new(Keeper::new(store, session, config, settings));
        keeper.bootstrap().context("bootstrap failed")?;
        Ok(Wired { keeper, connector })
    }
}
