use crate::error::{Result, SpamError};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Free-form attributes sent to or received from the remote API.
pub type Attrs = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// An API surface grouping resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Identity,
    Network,
    Storage,
    Compute,
    Image,
    Object,
}

impl Collection {
    pub fn all() -> &'static [Collection] {
        &[
            Collection::Identity,
            Collection::Network,
            Collection::Storage,
            Collection::Compute,
            Collection::Image,
            Collection::Object,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Identity => "identity",
            Collection::Network => "network",
            Collection::Storage => "storage",
            Collection::Compute => "compute",
            Collection::Image => "image",
            Collection::Object => "object",
        }
    }

    /// Kinds owned by this collection, in the order they can be safely
    /// deleted (dependents first).
    pub fn kinds(self) -> &'static [ResourceKind] {
        match self {
            Collection::Identity => &[ResourceKind::User, ResourceKind::Project],
            Collection::Network => &[
                ResourceKind::Subnet,
                ResourceKind::Port,
                ResourceKind::Router,
                ResourceKind::Network,
            ],
            Collection::Storage => &[ResourceKind::Volume],
            Collection::Compute => &[ResourceKind::Server, ResourceKind::Flavor],
            Collection::Image => &[ResourceKind::Image],
            Collection::Object => &[ResourceKind::Container],
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = SpamError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "identity" | "keystone" => Ok(Collection::Identity),
            "network" | "neutron" => Ok(Collection::Network),
            "storage" | "block-storage" | "cinder" => Ok(Collection::Storage),
            "compute" | "nova" => Ok(Collection::Compute),
            "image" | "glance" => Ok(Collection::Image),
            "object" | "object-storage" | "swift" => Ok(Collection::Object),
            _ => Err(SpamError::InvalidPipeline(format!("unknown collection '{s}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// ResourceKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    User,
    Project,
    Network,
    Subnet,
    Router,
    Port,
    Volume,
    Server,
    Flavor,
    Image,
    Container,
}

impl ResourceKind {
    pub fn all() -> &'static [ResourceKind] {
        &[
            ResourceKind::User,
            ResourceKind::Project,
            ResourceKind::Network,
            ResourceKind::Subnet,
            ResourceKind::Router,
            ResourceKind::Port,
            ResourceKind::Volume,
            ResourceKind::Server,
            ResourceKind::Flavor,
            ResourceKind::Image,
            ResourceKind::Container,
        ]
    }

    /// Stable plural key shared by the store and the pipeline vocabulary.
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::User => "users",
            ResourceKind::Project => "projects",
            ResourceKind::Network => "networks",
            ResourceKind::Subnet => "subnets",
            ResourceKind::Router => "routers",
            ResourceKind::Port => "ports",
            ResourceKind::Volume => "volumes",
            ResourceKind::Server => "servers",
            ResourceKind::Flavor => "flavors",
            ResourceKind::Image => "images",
            ResourceKind::Container => "containers",
        }
    }

    pub fn singular(self) -> &'static str {
        let plural = self.as_str();
        &plural[..plural.len() - 1]
    }

    pub fn collection(self) -> Collection {
        match self {
            ResourceKind::User | ResourceKind::Project => Collection::Identity,
            ResourceKind::Network
            | ResourceKind::Subnet
            | ResourceKind::Router
            | ResourceKind::Port => Collection::Network,
            ResourceKind::Volume => Collection::Storage,
            ResourceKind::Server | ResourceKind::Flavor => Collection::Compute,
            ResourceKind::Image => Collection::Image,
            ResourceKind::Container => Collection::Object,
        }
    }

    pub fn namespace(self) -> Namespace {
        Namespace::tracked(self)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = SpamError;

    fn from_str(s: &str) -> Result<Self> {
        ResourceKind::all()
            .iter()
            .copied()
            .find(|k| k.as_str() == s || k.singular() == s)
            .ok_or_else(|| SpamError::InvalidPipeline(format!("unknown resource kind '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Namespace
// ---------------------------------------------------------------------------

pub const CREDENTIALS: &str = "credentials";
pub const SETTINGS: &str = "settings";

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_\-]*$").unwrap())
}

/// A `(collection, kind)` section of the resource store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub collection: String,
    pub kind: String,
}

impl Namespace {
    pub fn new(collection: impl Into<String>, kind: impl Into<String>) -> Result<Self> {
        let ns = Namespace {
            collection: collection.into(),
            kind: kind.into(),
        };
        for part in [&ns.collection, &ns.kind] {
            if !name_re().is_match(part) {
                return Err(SpamError::InvalidName(part.clone()));
            }
        }
        Ok(ns)
    }

    pub fn tracked(kind: ResourceKind) -> Self {
        Namespace {
            collection: kind.collection().as_str().to_string(),
            kind: kind.as_str().to_string(),
        }
    }

    /// Credential records, keyed by principal name.
    pub fn credentials() -> Self {
        Namespace {
            collection: CREDENTIALS.to_string(),
            kind: "users".to_string(),
        }
    }

    /// Bootstrap settings: auth URL and API versions.
    pub fn settings() -> Self {
        Namespace {
            collection: SETTINGS.to_string(),
            kind: "api".to_string(),
        }
    }

    /// Ids that cleanup must never delete, with the kind as value.
    pub fn protected() -> Self {
        Namespace {
            collection: SETTINGS.to_string(),
            kind: "protected".to_string(),
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.collection != CREDENTIALS && self.collection != SETTINGS
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.kind)
    }
}

impl FromStr for Namespace {
    type Err = SpamError;

    fn from_str(s: &str) -> Result<Self> {
        let (collection, kind) = s
            .split_once('/')
            .ok_or_else(|| SpamError::InvalidName(s.to_string()))?;
        Namespace::new(collection, kind)
    }
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// Everything needed to open a session as one principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub project_name: String,
    #[serde(default = "default_domain")]
    pub user_domain_id: String,
    #[serde(default = "default_domain")]
    pub project_domain_id: String,
    pub auth_url: String,
    pub created_at: DateTime<Utc>,
}

fn default_domain() -> String {
    "default".to_string()
}

// ---------------------------------------------------------------------------
// RemoteObject
// ---------------------------------------------------------------------------

/// A resource as returned by the remote API. Only `id` is guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub attrs: Attrs,
}

impl RemoteObject {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
            attrs: Attrs::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: serde_json::Value) -> Self {
        self.attrs.insert(key.to_string(), value);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&serde_json::Value> {
        match key {
            "id" => None,
            _ => self.attrs.get(key),
        }
    }

    pub fn str_attr(&self, key: &str) -> Option<&str> {
        self.attr(key).and_then(|v| v.as_str())
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_aliases_parse() {
        assert_eq!("keystone".parse::<Collection>().unwrap(), Collection::Identity);
        assert_eq!("cinder".parse::<Collection>().unwrap(), Collection::Storage);
        assert_eq!("storage".parse::<Collection>().unwrap(), Collection::Storage);
        assert!("dns".parse::<Collection>().is_err());
    }

    #[test]
    fn every_kind_belongs_to_the_collection_that_lists_it() {
        for c in Collection::all() {
            for k in c.kinds() {
                assert_eq!(k.collection(), *c, "{k}");
            }
        }
        let listed: usize = Collection::all().iter().map(|c| c.kinds().len()).sum();
        assert_eq!(listed, ResourceKind::all().len());
    }

    #[test]
    fn kind_parses_plural_and_singular() {
        assert_eq!("volumes".parse::<ResourceKind>().unwrap(), ResourceKind::Volume);
        assert_eq!("volume".parse::<ResourceKind>().unwrap(), ResourceKind::Volume);
        assert_eq!(ResourceKind::Subnet.singular(), "subnet");
    }

    #[test]
    fn namespace_rejects_separator_and_uppercase() {
        assert!(Namespace::new("storage", "vol/umes").is_err());
        assert!(Namespace::new("Storage", "volumes").is_err());
        let ns: Namespace = "storage/volumes".parse().unwrap();
        assert_eq!(ns, ResourceKind::Volume.namespace());
        assert!(ns.is_tracked());
        assert!(!Namespace::credentials().is_tracked());
    }

    #[test]
    fn remote_object_flattens_attrs() {
        let obj: RemoteObject =
            serde_json::from_value(serde_json::json!({"id": "n1", "name": "net", "shared": true}))
                .unwrap();
        assert_eq!(obj.name(), "net");
        assert_eq!(obj.attr("shared"), Some(&serde_json::json!(true)));
    }
}
