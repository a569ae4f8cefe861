//! Allocator over the resource store.
//!
//! The keeper answers "give me a resource of kind K" for the actions: it
//! picks tracked ids at random, claims and releases exclusive ones, resolves
//! ids to remote objects through the administrative session, and cleans up
//! whatever the store tracks. Protected ids (the administrative principal
//! and tenancy, the base image, pre-existing flavors) are recorded at
//! bootstrap and never handed out for update, delete or cleanup.

use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{quota_body, quota_collections, Cloud, ResourceApi};
use crate::config::{Config, Settings};
use crate::error::{Result, SpamError};
use crate::names;
use crate::store::{Record, ResourceStore};
use crate::types::{Attrs, Collection, Namespace, RemoteObject, ResourceKind};

const NAME_ATTEMPTS: usize = 8;

/// What a [`Keeper::query`] predicate is applied to.
#[derive(Debug, Clone, Copy)]
pub enum Probe<'a> {
    /// The whole object as JSON.
    Object,
    /// One attribute (`id` and `name` included), `null` when absent.
    Field(&'a str),
    /// Ids of `kind` objects whose `parent_key` attribute points at the
    /// candidate, as a JSON array.
    Children {
        kind: ResourceKind,
        parent_key: &'a str,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanEntry {
    pub kind: ResourceKind,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanReport {
    pub deleted: Vec<CleanEntry>,
    pub kept: Vec<CleanEntry>,
    pub failed: Vec<CleanEntry>,
}

pub struct Keeper {
    store: Arc<ResourceStore>,
    admin: Arc<dyn Cloud>,
    config: Config,
    settings: Settings,
}

impl Keeper {
    pub fn new(
        store: Arc<ResourceStore>,
        admin: Arc<dyn Cloud>,
        config: Config,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            admin,
            config,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<ResourceStore> {
        &self.store
    }

    /// The administrative session.
    pub fn admin(&self) -> &Arc<dyn Cloud> {
        &self.admin
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Bootstrap
    // -----------------------------------------------------------------------

    /// Resolve and track the administrative principal and tenancy, lift the
    /// tenancy's quotas, and track the base image and existing flavors.
    pub fn bootstrap(&self) -> Result<()> {
        let users = self.admin.resource(ResourceKind::User)?;
        let user = self
            .get_by_name(users.as_ref(), &self.settings.admin_user)
            .ok_or_else(|| SpamError::AdminMissing(format!("user '{}'", self.settings.admin_user)))?;
        let projects = self.admin.resource(ResourceKind::Project)?;
        let project = self
            .get_by_name(projects.as_ref(), &self.config.admin_project)
            .ok_or_else(|| {
                SpamError::AdminMissing(format!("project '{}'", self.config.admin_project))
            })?;

        for (kind, id) in [
            (ResourceKind::User, &user.id),
            (ResourceKind::Project, &project.id),
        ] {
            self.track(kind, id)?;
            self.protect(kind, id)?;
        }
        self.lift_quotas(&project.id);

        let images = self.admin.resource(ResourceKind::Image)?;
        match self.get_by_name(images.as_ref(), &self.config.base_image) {
            Some(image) => {
                self.track(ResourceKind::Image, &image.id)?;
                self.protect(ResourceKind::Image, &image.id)?;
            }
            None => warn!(image = %self.config.base_image, "base image not found"),
        }

        let flavors = self.admin.resource(ResourceKind::Flavor)?;
        match flavors.list() {
            Ok(list) => {
                for flavor in list {
                    if self.track(ResourceKind::Flavor, &flavor.id)? {
                        self.protect(ResourceKind::Flavor, &flavor.id)?;
                    }
                }
            }
            Err(e) => warn!(error = %e, "cannot list flavors"),
        }

        info!(user = %user.id, project = %project.id, "bootstrap complete");
        Ok(())
    }

    /// Set every quota of `project_id` to the configured limit. Failures
    /// are logged.
    pub fn lift_quotas(&self, project_id: &str) {
        for &collection in quota_collections() {
            let body = quota_body(collection, self.config.quota_limit);
            if let Err(e) = self.admin.update_quotas(collection, project_id, &body) {
                warn!(%collection, project = project_id, error = %e, "quota update failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Tracking
    // -----------------------------------------------------------------------

    /// Start tracking `id` as unused. Returns false if it was already
    /// tracked, in which case its marker is left alone.
    pub fn track(&self, kind: ResourceKind, id: &str) -> Result<bool> {
        self.store.put_if_absent(&kind.namespace(), id, Record::unused())
    }

    /// Stop tracking `id`. Returns false if it was not tracked.
    pub fn untrack(&self, kind: ResourceKind, id: &str) -> Result<bool> {
        match self.store.delete(&kind.namespace(), id) {
            Ok(()) => Ok(true),
            Err(SpamError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn protect(&self, kind: ResourceKind, id: &str) -> Result<()> {
        self.store.put(
            &Namespace::protected(),
            id,
            Record::Setting {
                value: kind.to_string(),
            },
        )
    }

    pub fn is_protected(&self, id: &str) -> Result<bool> {
        self.store.contains(&Namespace::protected(), id)
    }

    fn protected_ids(&self) -> Result<HashSet<String>> {
        Ok(self.store.keys(&Namespace::protected())?.into_iter().collect())
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// The remote object for `id`, or `None` if the lookup fails for any
    /// reason.
    pub fn get_by_id(&self, api: &dyn ResourceApi, id: &str) -> Option<RemoteObject> {
        match api.get(id) {
            Ok(object) => Some(object),
            Err(e) => {
                debug!(kind = %api.kind(), id, error = %e, "lookup by id failed");
                None
            }
        }
    }

    pub fn get_by_name(&self, api: &dyn ResourceApi, name: &str) -> Option<RemoteObject> {
        match api.find(name) {
            Ok(object) => Some(object),
            Err(e) => {
                debug!(kind = %api.kind(), name, error = %e, "lookup by name failed");
                None
            }
        }
    }

    /// Like [`Keeper::get_by_id`], but a tracked id that no longer exists
    /// remotely is dropped from the store.
    pub fn resolve(&self, api: &dyn ResourceApi, id: &str) -> Result<Option<RemoteObject>> {
        if let Some(object) = self.get_by_id(api, id) {
            return Ok(Some(object));
        }
        if self.untrack(api.kind(), id)? {
            info!(kind = %api.kind(), id, "dropped stale entry");
        }
        Ok(None)
    }

    /// Objects of `kind` visible to `cloud` for which `predicate` holds on
    /// the value selected by `probe`. Listing failures yield nothing.
    pub fn query(
        &self,
        cloud: &dyn Cloud,
        kind: ResourceKind,
        probe: Probe<'_>,
        predicate: impl Fn(&Value) -> bool,
    ) -> Vec<RemoteObject> {
        let list = |kind: ResourceKind| -> Vec<RemoteObject> {
            match cloud.resource(kind).and_then(|api| api.list()) {
                Ok(list) => list,
                Err(e) => {
                    warn!(%kind, error = %e, "query listing failed");
                    Vec::new()
                }
            }
        };
        let children = match probe {
            Probe::Children { kind: child, .. } => list(child),
            _ => Vec::new(),
        };

        list(kind)
            .into_iter()
            .filter(|object| {
                let value = match probe {
                    Probe::Object => serde_json::to_value(object).unwrap_or(Value::Null),
                    Probe::Field("id") => Value::from(object.id.clone()),
                    Probe::Field("name") => object.name.clone().map(Value::from).unwrap_or(Value::Null),
                    Probe::Field(key) => object.attr(key).cloned().unwrap_or(Value::Null),
                    Probe::Children { parent_key, .. } => Value::Array(
                        children
                            .iter()
                            .filter(|c| c.str_attr(parent_key) == Some(object.id.as_str()))
                            .map(|c| Value::from(c.id.clone()))
                            .collect(),
                    ),
                };
                predicate(&value)
            })
            .collect()
    }

    /// A random name with the configured prefix that `api` does not know
    /// yet. `None` after a bounded number of collisions.
    pub fn unique_name(&self, api: &dyn ResourceApi) -> Option<String> {
        (0..NAME_ATTEMPTS)
            .map(|_| names::resource_name(&self.config.name_prefix))
            .find(|name| api.find(name).is_err())
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Any tracked id of `kind`.
    pub fn pick_random(&self, kind: ResourceKind) -> Result<Option<String>> {
        let ids = self.store.keys(&kind.namespace())?;
        Ok(ids.choose(&mut rand::thread_rng()).cloned())
    }

    /// A random tracked id that may be modified or deleted: neither
    /// protected nor marked used.
    pub fn pick_target(&self, kind: ResourceKind) -> Result<Option<String>> {
        self.pick_target_where(kind, |record| record.used() != Some(true))
    }

    /// A random unprotected id whose record satisfies `filter`.
    pub fn pick_target_where(
        &self,
        kind: ResourceKind,
        filter: impl Fn(&Record) -> bool,
    ) -> Result<Option<String>> {
        let protected = self.protected_ids()?;
        let ids: Vec<String> = self
            .store
            .entries(&kind.namespace())?
            .into_iter()
            .filter(|(id, record)| !protected.contains(id) && filter(record))
            .map(|(id, _)| id)
            .collect();
        Ok(ids.choose(&mut rand::thread_rng()).cloned())
    }

    /// Claim an unused id, marking it used. Two callers never receive the
    /// same id.
    pub fn pick_unused(&self, kind: ResourceKind) -> Result<Option<String>> {
        self.store.claim_first(&kind.namespace(), false, |_| true)
    }

    /// Claim a used id, marking it unused.
    pub fn pick_used(&self, kind: ResourceKind) -> Result<Option<String>> {
        self.store.claim_first(&kind.namespace(), true, |_| true)
    }

    /// Mark `id` unused again.
    pub fn release(&self, kind: ResourceKind, id: &str) -> Result<()> {
        self.store.set_used(&kind.namespace(), id, false)
    }

    /// Mark `id` used.
    pub fn occupy(&self, kind: ResourceKind, id: &str) -> Result<()> {
        self.store.set_used(&kind.namespace(), id, true)
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// Delete every tracked, unprotected resource in `collections`.
    ///
    /// Collections are processed dependents first (compute before storage
    /// before network, identity last). A failed remote delete keeps the
    /// entry for a later attempt unless the resource is already gone.
    pub fn clean(&self, collections: &[Collection]) -> Result<CleanReport> {
        let mut ordered: Vec<Collection> = collections.to_vec();
        ordered.sort_by_key(|c| clean_rank(*c));
        ordered.dedup();

        let mut report = CleanReport::default();
        for collection in ordered {
            for &kind in collection.kinds() {
                self.clean_kind(kind, &mut report)?;
            }
            if collection == Collection::Identity {
                self.drop_orphan_credentials()?;
            }
        }
        info!(
            deleted = report.deleted.len(),
            kept = report.kept.len(),
            failed = report.failed.len(),
            "clean complete"
        );
        Ok(report)
    }

    fn clean_kind(&self, kind: ResourceKind, report: &mut CleanReport) -> Result<()> {
        let ids = self.store.keys(&kind.namespace())?;
        if ids.is_empty() {
            return Ok(());
        }
        let entry = |id: &str, error: Option<String>| CleanEntry {
            kind,
            id: id.to_string(),
            error,
        };
        let api = match self.admin.resource(kind) {
            Ok(api) => api,
            Err(e) => {
                warn!(%kind, error = %e, "cannot clean");
                report
                    .failed
                    .extend(ids.iter().map(|id| entry(id, Some(e.to_string()))));
                return Ok(());
            }
        };
        let protected = self.protected_ids()?;

        for id in ids {
            if protected.contains(&id) {
                report.kept.push(entry(&id, None));
                continue;
            }
            if kind == ResourceKind::Volume {
                if let Err(e) = api.perform(&id, "detach", &Attrs::new()) {
                    debug!(%id, error = %e, "detach before delete");
                }
            }
            match api.delete(&id) {
                Ok(()) => {
                    self.untrack(kind, &id)?;
                    report.deleted.push(entry(&id, None));
                }
                Err(e) => {
                    if self.resolve(api.as_ref(), &id)?.is_none() {
                        report.deleted.push(entry(&id, None));
                    } else {
                        warn!(%kind, %id, error = %e, "delete failed");
                        report.failed.push(entry(&id, Some(e.to_string())));
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop credentials of users that are no longer tracked. The
    /// administrative credential and those of users whose delete failed
    /// stay.
    fn drop_orphan_credentials(&self) -> Result<()> {
        let mut keep: HashSet<String> = HashSet::from([self.settings.admin_user.clone()]);
        let users = self.admin.resource(ResourceKind::User)?;
        for id in self.store.keys(&ResourceKind::User.namespace())? {
            if let Some(user) = self.get_by_id(users.as_ref(), &id) {
                keep.insert(user.name().to_string());
            }
        }
        let removed = self
            .store
            .clear(&Namespace::credentials(), |name| keep.contains(name))?;
        debug!(removed, kept = keep.len(), "dropped credentials");
        Ok(())
    }
}

fn clean_rank(collection: Collection) -> u8 {
    match collection {
        Collection::Compute => 0,
        Collection::Storage => 1,
        Collection::Network => 2,
        Collection::Image => 3,
        Collection::Object => 4,
        Collection::Identity => 5,
    }
}
