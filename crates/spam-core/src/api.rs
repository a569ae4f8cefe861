//! Capability boundary towards the remote control plane.
//!
//! The core never talks to a transport directly. Each resource kind is
//! reached through a [`ResourceApi`] handed out by a per-session [`Cloud`];
//! sessions are opened from a [`Credential`] by a [`Connector`].

use std::sync::Arc;

use crate::error::{Result, SpamError};
use crate::types::{Attrs, Collection, Credential, RemoteObject, ResourceKind};

/// The fixed capability set every resource kind exposes.
pub trait ResourceApi: Send + Sync {
    fn kind(&self) -> ResourceKind;

    fn create(&self, attrs: &Attrs) -> Result<RemoteObject>;

    fn update(&self, id: &str, attrs: &Attrs) -> Result<RemoteObject>;

    fn delete(&self, id: &str) -> Result<()>;

    fn get(&self, id: &str) -> Result<RemoteObject>;

    fn find(&self, name: &str) -> Result<RemoteObject>;

    fn list(&self) -> Result<Vec<RemoteObject>>;

    /// Kind-specific operations beyond the six above (volume attach,
    /// role grant, image upload, ...).
    fn perform(&self, id: &str, operation: &str, attrs: &Attrs) -> Result<RemoteObject> {
        let _ = (id, attrs);
        Err(SpamError::Unsupported {
            operation: operation.to_string(),
            kind: self.kind().to_string(),
        })
    }
}

/// One authenticated session against the remote system.
pub trait Cloud: Send + Sync {
    /// Principal this session acts as.
    fn principal(&self) -> &str;

    fn resource(&self, kind: ResourceKind) -> Result<Arc<dyn ResourceApi>>;

    /// Replace the quota set of `project_id` within `collection`.
    fn update_quotas(&self, collection: Collection, project_id: &str, quotas: &Attrs)
        -> Result<()>;
}

/// Opens sessions.
pub trait Connector: Send + Sync {
    fn connect(&self, credential: &Credential) -> Result<Arc<dyn Cloud>>;
}

/// Quota keys lifted for a project, per collection.
pub fn quota_keys(collection: Collection) -> &'static [&'static str] {
    match collection {
        Collection::Storage => &[
            "backup_gigabytes",
            "backups",
            "gigabytes",
            "per_volume_gigabytes",
            "snapshots",
            "volumes",
        ],
        Collection::Network => &[
            "subnet",
            "network",
            "floatingip",
            "subnetpool",
            "port",
            "security_group_rule",
            "security_group",
            "router",
            "rbac_policy",
        ],
        Collection::Compute => &[
            "cores",
            "fixed_ips",
            "floating_ips",
            "injected_file_content_bytes",
            "injected_file_path_bytes",
            "injected_files",
            "instances",
            "key_pairs",
            "metadata_items",
            "ram",
            "security_group_rules",
            "security_groups",
            "server_group_members",
            "server_groups",
        ],
        Collection::Identity | Collection::Image | Collection::Object => &[],
    }
}

/// Collections that carry per-project quotas.
pub fn quota_collections() -> &'static [Collection] {
    &[Collection::Storage, Collection::Network, Collection::Compute]
}

/// Build the quota body that sets every key of `collection` to `limit`.
pub fn quota_body(collection: Collection, limit: i64) -> Attrs {
    quota_keys(collection)
        .iter()
        .map(|k| (k.to_string(), serde_json::Value::from(limit)))
        .collect()
}
