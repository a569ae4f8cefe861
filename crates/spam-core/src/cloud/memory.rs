//! In-process simulated control plane.
//!
//! Behaves like a small, strict cloud: ids are UUIDs, names are not unique,
//! deletes respect dependencies (a network with subnets cannot go, an
//! attached volume cannot go) and sessions authenticate against the users
//! it knows. Faults can be injected per `(kind, operation)`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};

use crate::api::{Cloud, Connector, ResourceApi};
use crate::error::{Result, SpamError};
use crate::types::{Attrs, Collection, Credential, RemoteObject, ResourceKind};

// ---------------------------------------------------------------------------
// World state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Fault {
    kind: ResourceKind,
    operation: String,
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct World {
    objects: BTreeMap<ResourceKind, BTreeMap<String, RemoteObject>>,
    quotas: BTreeMap<(Collection, String), Attrs>,
    passwords: HashMap<String, String>,
    faults: Vec<Fault>,
    calls: BTreeMap<(ResourceKind, String), usize>,
}

impl World {
    /// Count the call and fire a matching fault, if any.
    fn enter(&mut self, kind: ResourceKind, operation: &str) -> Result<()> {
        *self
            .calls
            .entry((kind, operation.to_string()))
            .or_default() += 1;
        let Some(pos) = self
            .faults
            .iter()
            .position(|f| f.kind == kind && f.operation == operation)
        else {
            return Ok(());
        };
        let exhausted = match self.faults[pos].remaining.as_mut() {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        };
        if exhausted {
            self.faults.remove(pos);
        }
        Err(SpamError::remote(operation, kind.as_str(), "503 injected fault"))
    }

    fn table(&mut self, kind: ResourceKind) -> &mut BTreeMap<String, RemoteObject> {
        self.objects.entry(kind).or_default()
    }

    fn exists(&self, kind: ResourceKind, id: &str) -> bool {
        self.objects.get(&kind).is_some_and(|t| t.contains_key(id))
    }

    fn lookup(&self, kind: ResourceKind, id: &str, operation: &str) -> Result<RemoteObject> {
        self.objects
            .get(&kind)
            .and_then(|t| t.get(id))
            .cloned()
            .ok_or_else(|| not_found(kind, operation, id))
    }

    fn referenced_by(&self, kind: ResourceKind, key: &str, id: &str) -> usize {
        self.objects
            .get(&kind)
            .map(|t| t.values().filter(|o| o.str_attr(key) == Some(id)).count())
            .unwrap_or(0)
    }
}

fn not_found(kind: ResourceKind, operation: &str, id: &str) -> SpamError {
    SpamError::remote(
        operation,
        kind.as_str(),
        format!("404 Not Found: {} {id}", kind.singular()),
    )
}

fn rejected(kind: ResourceKind, operation: &str, message: impl std::fmt::Display) -> SpamError {
    SpamError::remote(operation, kind.as_str(), message)
}

// ---------------------------------------------------------------------------
// MemoryCloud
// ---------------------------------------------------------------------------

/// Handle to one simulated cloud. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryCloud {
    world: Arc<Mutex<World>>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cloud holding the administrative user and tenancy, the base image
    /// and two flavors.
    pub fn seeded(admin: &Credential, admin_project: &str, base_image: &str) -> Self {
        let cloud = Self::new();
        let project = cloud.insert(
            ResourceKind::Project,
            RemoteObject::new(uuid::Uuid::new_v4().to_string(), Some(admin_project.into()))
                .with_attr("domain_id", json!(admin.project_domain_id)),
        );
        cloud.insert(
            ResourceKind::User,
            RemoteObject::new(uuid::Uuid::new_v4().to_string(), Some(admin.username.clone()))
                .with_attr("default_project_id", json!(project.id))
                .with_attr("password", json!(admin.password)),
        );
        cloud.insert(
            ResourceKind::Image,
            RemoteObject::new(uuid::Uuid::new_v4().to_string(), Some(base_image.into()))
                .with_attr("status", json!("active")),
        );
        for (name, ram, vcpus) in [("m1.tiny", 512, 1), ("m1.small", 2048, 1)] {
            cloud.insert(
                ResourceKind::Flavor,
                RemoteObject::new(uuid::Uuid::new_v4().to_string(), Some(name.into()))
                    .with_attr("ram", json!(ram))
                    .with_attr("vcpus", json!(vcpus))
                    .with_attr("disk", json!(1)),
            );
        }
        cloud
    }

    fn lock(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Place an object directly, bypassing faults and checks.
    pub fn insert(&self, kind: ResourceKind, mut object: RemoteObject) -> RemoteObject {
        let mut world = self.lock();
        if kind == ResourceKind::User {
            if let Some(Value::String(pw)) = object.attrs.remove("password") {
                world.passwords.insert(object.name().to_string(), pw);
            }
        }
        world.table(kind).insert(object.id.clone(), object.clone());
        object
    }

    /// Make `operation` on `kind` fail `times` times, or forever with `None`.
    pub fn fail(&self, kind: ResourceKind, operation: &str, times: Option<u32>) {
        self.lock().faults.push(Fault {
            kind,
            operation: operation.to_string(),
            remaining: times,
        });
    }

    pub fn calls(&self, kind: ResourceKind, operation: &str) -> usize {
        self.lock()
            .calls
            .get(&(kind, operation.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn objects(&self, kind: ResourceKind) -> Vec<RemoteObject> {
        self.lock()
            .objects
            .get(&kind)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn quotas(&self, collection: Collection, project_id: &str) -> Option<Attrs> {
        self.lock()
            .quotas
            .get(&(collection, project_id.to_string()))
            .cloned()
    }
}

impl Connector for MemoryCloud {
    fn connect(&self, credential: &Credential) -> Result<Arc<dyn Cloud>> {
        let world = self.lock();
        match world.passwords.get(&credential.username) {
            Some(pw) if *pw == credential.password => {}
            _ => {
                return Err(SpamError::remote(
                    "authenticate",
                    ResourceKind::User.as_str(),
                    format!("401 Unauthorized: {}", credential.username),
                ))
            }
        }
        Ok(Arc::new(Session {
            cloud: self.clone(),
            principal: credential.username.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Session {
    cloud: MemoryCloud,
    principal: String,
}

impl Cloud for Session {
    fn principal(&self) -> &str {
        &self.principal
    }

    fn resource(&self, kind: ResourceKind) -> Result<Arc<dyn ResourceApi>> {
        Ok(Arc::new(MemoryApi {
            cloud: self.cloud.clone(),
            kind,
        }))
    }

    fn update_quotas(&self, collection: Collection, project_id: &str, quotas: &Attrs) -> Result<()> {
        let mut world = self.cloud.lock();
        world.enter(ResourceKind::Project, "update_quotas")?;
        if !world.exists(ResourceKind::Project, project_id) {
            return Err(not_found(ResourceKind::Project, "update_quotas", project_id));
        }
        world
            .quotas
            .insert((collection, project_id.to_string()), quotas.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-kind API
// ---------------------------------------------------------------------------

struct MemoryApi {
    cloud: MemoryCloud,
    kind: ResourceKind,
}

impl MemoryApi {
    fn require_ref(&self, world: &World, attrs: &Attrs, key: &str, target: ResourceKind) -> Result<String> {
        let id = attrs
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| rejected(self.kind, "create", format!("400 Bad Request: {key} required")))?;
        if !world.exists(target, id) {
            return Err(not_found(target, "create", id));
        }
        Ok(id.to_string())
    }
}

impl ResourceApi for MemoryApi {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn create(&self, attrs: &Attrs) -> Result<RemoteObject> {
        let mut world = self.cloud.lock();
        world.enter(self.kind, "create")?;
        let name = attrs.get("name").and_then(Value::as_str).map(str::to_string);
        let mut attrs = attrs.clone();
        attrs.remove("name");

        match self.kind {
            ResourceKind::Subnet => {
                self.require_ref(&world, &attrs, "network_id", ResourceKind::Network)?;
                if !attrs.contains_key("cidr") {
                    return Err(rejected(self.kind, "create", "400 Bad Request: cidr required"));
                }
            }
            ResourceKind::Port => {
                self.require_ref(&world, &attrs, "network_id", ResourceKind::Network)?;
            }
            ResourceKind::Server => {
                self.require_ref(&world, &attrs, "imageRef", ResourceKind::Image)?;
                self.require_ref(&world, &attrs, "flavorRef", ResourceKind::Flavor)?;
                attrs.insert("status".into(), json!("ACTIVE"));
            }
            ResourceKind::Volume => {
                attrs.insert("status".into(), json!("available"));
            }
            ResourceKind::Image => {
                attrs.insert("status".into(), json!("queued"));
            }
            ResourceKind::User => {
                if let (Some(n), Some(Value::String(pw))) = (&name, attrs.remove("password")) {
                    world.passwords.insert(n.clone(), pw);
                }
            }
            _ => {}
        }

        let id = match (self.kind, &name) {
            (ResourceKind::Container, Some(n)) => n.clone(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let object = RemoteObject { id, name, attrs };
        world.table(self.kind).insert(object.id.clone(), object.clone());
        Ok(object)
    }

    fn update(&self, id: &str, attrs: &Attrs) -> Result<RemoteObject> {
        let mut world = self.cloud.lock();
        world.enter(self.kind, "update")?;
        let mut object = world.lookup(self.kind, id, "update")?;
        let old_name = object.name().to_string();
        for (key, value) in attrs {
            match (key.as_str(), value) {
                ("name", Value::String(n)) => object.name = Some(n.clone()),
                ("password", Value::String(pw)) if self.kind == ResourceKind::User => {
                    world.passwords.insert(old_name.clone(), pw.clone());
                }
                _ => {
                    object.attrs.insert(key.clone(), value.clone());
                }
            }
        }
        if self.kind == ResourceKind::User && object.name() != old_name {
            if let Some(pw) = world.passwords.remove(&old_name) {
                world.passwords.insert(object.name().to_string(), pw);
            }
        }
        world.table(self.kind).insert(id.to_string(), object.clone());
        Ok(object)
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut world = self.cloud.lock();
        world.enter(self.kind, "delete")?;
        let object = world.lookup(self.kind, id, "delete")?;
        match self.kind {
            ResourceKind::Network => {
                let dependents = world.referenced_by(ResourceKind::Subnet, "network_id", id)
                    + world.referenced_by(ResourceKind::Port, "network_id", id);
                if dependents > 0 {
                    return Err(rejected(
                        self.kind,
                        "delete",
                        format!("409 Conflict: network {id} has {dependents} dependent resources"),
                    ));
                }
            }
            ResourceKind::Volume if object.str_attr("status") == Some("in-use") => {
                return Err(rejected(
                    self.kind,
                    "delete",
                    format!("400 Bad Request: volume {id} is attached"),
                ));
            }
            ResourceKind::Server => {
                for volume in world.table(ResourceKind::Volume).values_mut() {
                    if volume.str_attr("attached_to") == Some(id) {
                        volume.attrs.remove("attached_to");
                        volume.attrs.insert("status".into(), json!("available"));
                    }
                }
            }
            ResourceKind::User => {
                world.passwords.remove(object.name());
            }
            _ => {}
        }
        world.table(self.kind).remove(id);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<RemoteObject> {
        let mut world = self.cloud.lock();
        world.enter(self.kind, "get")?;
        world.lookup(self.kind, id, "get")
    }

    fn find(&self, name: &str) -> Result<RemoteObject> {
        let mut world = self.cloud.lock();
        world.enter(self.kind, "find")?;
        world
            .table(self.kind)
            .values()
            .find(|o| o.name() == name)
            .cloned()
            .ok_or_else(|| not_found(self.kind, "find", name))
    }

    fn list(&self) -> Result<Vec<RemoteObject>> {
        let mut world = self.cloud.lock();
        world.enter(self.kind, "list")?;
        Ok(world.table(self.kind).values().cloned().collect())
    }

    fn perform(&self, id: &str, operation: &str, attrs: &Attrs) -> Result<RemoteObject> {
        let mut world = self.cloud.lock();
        world.enter(self.kind, operation)?;
        let mut object = world.lookup(self.kind, id, operation)?;
        let status = object.str_attr("status").unwrap_or_default().to_string();

        match (self.kind, operation) {
            (ResourceKind::User, "grant_role") => {
                let project = attrs.get("project_id").and_then(Value::as_str).unwrap_or_default();
                if !world.exists(ResourceKind::Project, project) {
                    return Err(not_found(ResourceKind::Project, operation, project));
                }
                let role = attrs.get("role").cloned().unwrap_or(json!("member"));
                let roles = object.attrs.entry("roles").or_insert_with(|| json!([]));
                if let Value::Array(list) = roles {
                    list.push(json!({ "project_id": project, "role": role }));
                }
            }
            (ResourceKind::Volume, "attach") => {
                let server = attrs.get("server_id").and_then(Value::as_str).unwrap_or_default();
                if !world.exists(ResourceKind::Server, server) {
                    return Err(not_found(ResourceKind::Server, operation, server));
                }
                if status != "available" {
                    return Err(rejected(
                        self.kind,
                        operation,
                        format!("400 Bad Request: volume {id} is {status}"),
                    ));
                }
                object.attrs.insert("status".into(), json!("in-use"));
                object.attrs.insert("attached_to".into(), json!(server));
            }
            (ResourceKind::Volume, "detach") => {
                if status != "in-use" {
                    return Err(rejected(
                        self.kind,
                        operation,
                        format!("400 Bad Request: volume {id} is not attached"),
                    ));
                }
                object.attrs.remove("attached_to");
                object.attrs.insert("status".into(), json!("available"));
            }
            (ResourceKind::Volume, "extend") => {
                let current = object.attr("size").and_then(Value::as_u64).unwrap_or(0);
                let requested = attrs.get("new_size").and_then(Value::as_u64).unwrap_or(0);
                if requested <= current {
                    return Err(rejected(
                        self.kind,
                        operation,
                        format!("400 Bad Request: new size {requested} <= {current}"),
                    ));
                }
                object.attrs.insert("size".into(), json!(requested));
            }
            (ResourceKind::Image, "upload") => {
                object.attrs.insert("status".into(), json!("active"));
            }
            _ => {
                return Err(SpamError::Unsupported {
                    operation: operation.to_string(),
                    kind: self.kind.to_string(),
                })
            }
        }

        world.table(self.kind).insert(id.to_string(), object.clone());
        Ok(object)
    }
}
