//! The action set: every `(collection, kind, verb)` a pipeline may schedule.
//!
//! Each action is a plain function over an [`ActionContext`]. Its effect on
//! the resource store is declared next to it in the registry rather than
//! inferred from its name: a `Register(kind)` action tracks the object it
//! returns, a `Deregister(kind)` action untracks the id it returns. The
//! wrapper in [`ActionSet::invoke`] applies the effect only after the remote
//! call succeeded, and turns action-local failures into an [`Outcome`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::api::{Cloud, ResourceApi};
use crate::error::{Result, SpamError};
use crate::keeper::Keeper;
use crate::names;
use crate::types::{Attrs, Collection, RemoteObject, ResourceKind};

/// Build an [`ActionSpec`]; `effect` defaults to [`Effect::None`].
macro_rules! action {
    (@effect) => {
        $crate::actions::Effect::None
    };
    (@effect $effect:expr) => {
        $effect
    };
    (
        kind: $kind:expr,
        verb: $verb:expr,
        handler: $handler:expr
        $(, effect: $effect:expr)?
    ) => {
        $crate::actions::ActionSpec {
            kind: $kind,
            verb: $verb,
            handler: $handler,
            effect: action!(@effect $($effect)?),
        }
    };
}

mod compute;
mod identity;
mod image;
mod network;
mod object;
mod storage;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Store-side effect of a successful action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Register(ResourceKind),
    Deregister(ResourceKind),
    None,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Register(kind) => write!(f, "register {}", kind.namespace()),
            Effect::Deregister(kind) => write!(f, "deregister {}", kind.namespace()),
            Effect::None => f.write_str("-"),
        }
    }
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Created(RemoteObject),
    Updated(RemoteObject),
    Deleted(String),
    /// A kind-specific operation (attach, extend, ...) on this id.
    Changed(String),
    /// A dependency was missing; nothing was attempted remotely.
    Skipped(String),
    /// The remote call failed; the store is untouched.
    Failed(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Created(_) => "created",
            Outcome::Updated(_) => "updated",
            Outcome::Deleted(_) => "deleted",
            Outcome::Changed(_) => "changed",
            Outcome::Skipped(_) => "skipped",
            Outcome::Failed(_) => "failed",
        }
    }
}

pub type Handler = fn(&ActionContext<'_>) -> Result<Outcome>;

pub struct ActionSpec {
    pub kind: ResourceKind,
    pub verb: &'static str,
    pub handler: Handler,
    pub effect: Effect,
}

impl ActionSpec {
    pub fn collection(&self) -> Collection {
        self.kind.collection()
    }

    /// `collection/kind/verb`.
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.collection(), self.kind, self.verb)
    }
}

/// Handle to a registered action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionRef(usize);

/// What an action runs against: the allocator and the branch's session.
pub struct ActionContext<'a> {
    pub keeper: &'a Keeper,
    pub cloud: &'a dyn Cloud,
}

// ---------------------------------------------------------------------------
// ActionSet
// ---------------------------------------------------------------------------

pub struct ActionSet {
    specs: Vec<ActionSpec>,
    index: HashMap<String, usize>,
}

impl Default for ActionSet {
    fn default() -> Self {
        Self::new(default_actions())
    }
}

/// The built-in catalogue.
pub fn default_actions() -> Vec<ActionSpec> {
    let mut specs = Vec::new();
    specs.extend(identity::actions());
    specs.extend(network::actions());
    specs.extend(storage::actions());
    specs.extend(compute::actions());
    specs.extend(image::actions());
    specs.extend(object::actions());
    specs
}

impl ActionSet {
    /// Later specs with the same id replace earlier ones.
    pub fn new(specs: Vec<ActionSpec>) -> Self {
        let mut index = HashMap::new();
        for (pos, spec) in specs.iter().enumerate() {
            index.insert(spec.id(), pos);
        }
        Self { specs, index }
    }

    pub fn specs(&self) -> &[ActionSpec] {
        &self.specs
    }

    pub fn spec(&self, action: ActionRef) -> &ActionSpec {
        &self.specs[action.0]
    }

    /// Resolve a pipeline path (`kind`, `verb`) under `collection`.
    pub fn resolve(&self, collection: Collection, path: &[String]) -> Result<ActionRef> {
        let unknown = || SpamError::UnknownAction(format!("{collection}/{}", path.join("/")));
        let [kind, verb] = path else {
            return Err(unknown());
        };
        let kind: ResourceKind = kind.parse().map_err(|_| unknown())?;
        if kind.collection() != collection {
            return Err(unknown());
        }
        self.index
            .get(&format!("{collection}/{kind}/{verb}"))
            .map(|pos| ActionRef(*pos))
            .ok_or_else(unknown)
    }

    /// Run one action and apply its declared store effect.
    ///
    /// Missing dependencies become [`Outcome::Skipped`], remote failures
    /// [`Outcome::Failed`]; only store and configuration errors are
    /// returned as `Err`.
    pub fn invoke(&self, action: ActionRef, ctx: &ActionContext<'_>) -> Result<Outcome> {
        let spec = self.spec(action);
        let id = spec.id();
        let outcome = match (spec.handler)(ctx) {
            Ok(outcome) => outcome,
            Err(e) if !e.is_recoverable() => return Err(e),
            Err(SpamError::EmptySelection(what)) => Outcome::Skipped(format!("nothing to pick in {what}")),
            Err(e @ SpamError::NotFound { .. }) => Outcome::Skipped(e.to_string()),
            Err(e) => {
                warn!(action = %id, principal = ctx.cloud.principal(), error = %e, "action failed");
                Outcome::Failed(e.to_string())
            }
        };

        match (&outcome, spec.effect) {
            (Outcome::Created(object) | Outcome::Updated(object), Effect::Register(kind)) => {
                ctx.keeper.track(kind, &object.id)?;
            }
            (Outcome::Deleted(object_id), Effect::Deregister(kind)) => {
                ctx.keeper.untrack(kind, object_id)?;
            }
            _ => {}
        }
        debug!(action = %id, outcome = outcome.label(), "action done");
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Shared handler helpers
// ---------------------------------------------------------------------------

pub(crate) fn attrs(value: Value) -> Attrs {
    match value {
        Value::Object(map) => map,
        _ => Attrs::new(),
    }
}

fn empty(kind: ResourceKind) -> SpamError {
    SpamError::EmptySelection(kind.namespace().to_string())
}

impl<'a> ActionContext<'a> {
    pub fn new(keeper: &'a Keeper, cloud: &'a dyn Cloud) -> Self {
        Self { keeper, cloud }
    }

    fn api(&self, kind: ResourceKind) -> Result<Arc<dyn ResourceApi>> {
        self.cloud.resource(kind)
    }

    fn fresh_name(&self, api: &dyn ResourceApi) -> Result<String> {
        self.keeper
            .unique_name(api)
            .ok_or_else(|| SpamError::EmptySelection(format!("free {} name", api.kind())))
    }

    /// Any tracked id of `kind`.
    fn pick(&self, kind: ResourceKind) -> Result<String> {
        self.keeper.pick_random(kind)?.ok_or_else(|| empty(kind))
    }

    /// A tracked id of `kind` that may be modified.
    fn target(&self, kind: ResourceKind) -> Result<String> {
        self.keeper.pick_target(kind)?.ok_or_else(|| empty(kind))
    }

    /// Resolve a tracked id through the administrative session; ids gone
    /// remotely are dropped from the store and reported as `NotFound`.
    fn lookup(&self, kind: ResourceKind, id: &str) -> Result<RemoteObject> {
        let api = self.keeper.admin().resource(kind)?;
        self.keeper
            .resolve(api.as_ref(), id)?
            .ok_or_else(|| SpamError::NotFound {
                namespace: kind.namespace().to_string(),
                id: id.to_string(),
            })
    }

    /// Restore a used marker changed by a claim, tolerating ids dropped in
    /// the meantime.
    fn restore(&self, kind: ResourceKind, id: &str, used: bool) -> Result<()> {
        let result = match used {
            true => self.keeper.occupy(kind, id),
            false => self.keeper.release(kind, id),
        };
        match result {
            Err(SpamError::NotFound { .. }) => Ok(()),
            other => other,
        }
    }
}

/// Create a `kind` with a fresh name and the attributes from `build`.
fn create_named(
    ctx: &ActionContext<'_>,
    kind: ResourceKind,
    build: impl FnOnce(&str) -> Attrs,
) -> Result<Outcome> {
    let api = ctx.api(kind)?;
    let name = ctx.fresh_name(api.as_ref())?;
    let mut body = build(&name);
    body.insert("name".into(), json!(name));
    let object = api.create(&body)?;
    info!(%kind, id = %object.id, %name, "created");
    Ok(Outcome::Created(object))
}

/// Rename a random unprotected `kind`.
fn rename(ctx: &ActionContext<'_>, kind: ResourceKind) -> Result<Outcome> {
    let id = ctx.target(kind)?;
    ctx.lookup(kind, &id)?;
    let api = ctx.api(kind)?;
    let name = ctx.fresh_name(api.as_ref())?;
    let object = api.update(
        &id,
        &attrs(json!({ "name": name, "description": names::description() })),
    )?;
    info!(%kind, %id, %name, "renamed");
    Ok(Outcome::Updated(object))
}

/// Delete `id`; an id that turns out to be gone already is skipped.
fn delete_id(ctx: &ActionContext<'_>, kind: ResourceKind, id: String) -> Result<Outcome> {
    let api = ctx.api(kind)?;
    match api.delete(&id) {
        Ok(()) => {
            info!(%kind, %id, "deleted");
            Ok(Outcome::Deleted(id))
        }
        Err(e) => {
            let admin = ctx.keeper.admin().resource(kind)?;
            match ctx.keeper.resolve(admin.as_ref(), &id)? {
                None => Ok(Outcome::Skipped(format!("{kind} {id} already gone"))),
                Some(_) => Err(e),
            }
        }
    }
}

/// Delete a random unprotected `kind`.
fn delete_random(ctx: &ActionContext<'_>, kind: ResourceKind) -> Result<Outcome> {
    let id = ctx.target(kind)?;
    delete_id(ctx, kind, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Record;
    use crate::testing::Fixture;
    use crate::types::Namespace;

    fn path(kind: &str, verb: &str) -> Vec<String> {
        vec![kind.to_string(), verb.to_string()]
    }

    #[test]
    fn catalogue_ids_are_unique() {
        let specs = default_actions();
        let set = ActionSet::default();
        assert_eq!(set.specs().len(), specs.len());
        assert_eq!(set.index.len(), specs.len());
    }

    #[test]
    fn every_registering_action_names_its_own_kind() {
        for spec in default_actions() {
            match spec.effect {
                Effect::Register(kind) | Effect::Deregister(kind) => {
                    assert_eq!(kind, spec.kind, "{}", spec.id())
                }
                Effect::None => {}
            }
        }
    }

    #[test]
    fn resolve_checks_collection_kind_and_verb() {
        let set = ActionSet::default();
        let action = set
            .resolve(Collection::Storage, &path("volumes", "create"))
            .unwrap();
        assert_eq!(set.spec(action).id(), "storage/volumes/create");
        assert!(set
            .resolve(Collection::Storage, &path("volume", "attach"))
            .is_ok());

        for bad in [
            (Collection::Storage, path("volumes", "explode")),
            (Collection::Compute, path("volumes", "create")),
            (Collection::Storage, vec!["volumes".to_string()]),
        ] {
            let err = set.resolve(bad.0, &bad.1).unwrap_err();
            assert!(matches!(err, SpamError::UnknownAction(_)));
        }
    }

    #[test]
    fn failed_project_create_leaves_store_unchanged() {
        let fx = Fixture::new();
        let set = ActionSet::default();
        let before = fx.store.entries(&ResourceKind::Project.namespace()).unwrap();
        fx.cloud.fail(ResourceKind::Project, "create", Some(1));

        let action = set
            .resolve(Collection::Identity, &path("projects", "create"))
            .unwrap();
        let ctx = ActionContext::new(&fx.keeper, fx.admin.as_ref());
        let outcome = set.invoke(action, &ctx).unwrap();

        assert!(matches!(outcome, Outcome::Failed(_)));
        assert_eq!(
            fx.store.entries(&ResourceKind::Project.namespace()).unwrap(),
            before
        );
    }

    #[test]
    fn created_project_is_tracked_with_lifted_quotas() {
        let fx = Fixture::new();
        let set = ActionSet::default();
        let action = set
            .resolve(Collection::Identity, &path("projects", "create"))
            .unwrap();
        let ctx = ActionContext::new(&fx.keeper, fx.admin.as_ref());

        let Outcome::Created(project) = set.invoke(action, &ctx).unwrap() else {
            panic!("expected a created project");
        };
        assert_eq!(
            fx.store
                .get(&ResourceKind::Project.namespace(), &project.id)
                .unwrap(),
            Record::unused()
        );
        assert!(fx.cloud.quotas(Collection::Network, &project.id).is_some());
    }

    #[test]
    fn delete_of_vanished_resource_is_skipped_and_untracked() {
        let fx = Fixture::new();
        fx.keeper.track(ResourceKind::Router, "r-gone").unwrap();
        let set = ActionSet::default();
        let action = set
            .resolve(Collection::Network, &path("routers", "delete"))
            .unwrap();
        let ctx = ActionContext::new(&fx.keeper, fx.admin.as_ref());

        let outcome = set.invoke(action, &ctx).unwrap();
        assert!(matches!(outcome, Outcome::Skipped(_)), "{outcome:?}");
        assert!(!fx
            .store
            .contains(&ResourceKind::Router.namespace(), "r-gone")
            .unwrap());
    }

    #[test]
    fn nothing_to_update_is_skipped() {
        let fx = Fixture::new();
        let set = ActionSet::default();
        let action = set
            .resolve(Collection::Network, &path("networks", "update"))
            .unwrap();
        let ctx = ActionContext::new(&fx.keeper, fx.admin.as_ref());
        let outcome = set.invoke(action, &ctx).unwrap();
        assert_eq!(
            outcome,
            Outcome::Skipped(format!(
                "nothing to pick in {}",
                Namespace::tracked(ResourceKind::Network)
            ))
        );
    }
}
