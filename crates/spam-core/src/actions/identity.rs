use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{attrs, create_named, delete_id, delete_random, rename, ActionContext, ActionSpec, Effect, Outcome};
use crate::error::{Result, SpamError};
use crate::names;
use crate::store::Record;
use crate::types::{Credential, Namespace, ResourceKind};

pub(super) fn actions() -> Vec<ActionSpec> {
    vec![
        action! {
            kind: ResourceKind::User,
            verb: "create",
            handler: create_user,
            effect: Effect::Register(ResourceKind::User)
        },
        action! {
            kind: ResourceKind::User,
            verb: "update",
            handler: update_user,
            effect: Effect::Register(ResourceKind::User)
        },
        action! {
            kind: ResourceKind::User,
            verb: "delete",
            handler: delete_user,
            effect: Effect::Deregister(ResourceKind::User)
        },
        action! {
            kind: ResourceKind::Project,
            verb: "create",
            handler: create_project,
            effect: Effect::Register(ResourceKind::Project)
        },
        action! {
            kind: ResourceKind::Project,
            verb: "update",
            handler: |ctx| rename(ctx, ResourceKind::Project),
            effect: Effect::Register(ResourceKind::Project)
        },
        action! {
            kind: ResourceKind::Project,
            verb: "delete",
            handler: |ctx| delete_random(ctx, ResourceKind::Project),
            effect: Effect::Deregister(ResourceKind::Project)
        },
    ]
}

/// A user in a random tracked project, granted `admin` there, with its
/// credential recorded so later branches can log in as it.
fn create_user(ctx: &ActionContext<'_>) -> Result<Outcome> {
    let project_id = ctx.pick(ResourceKind::Project)?;
    let project = ctx.lookup(ResourceKind::Project, &project_id)?;
    let domain = project.str_attr("domain_id").unwrap_or("default").to_string();
    let password = names::password();

    let users = ctx.api(ResourceKind::User)?;
    let name = ctx.fresh_name(users.as_ref())?;
    let user = users.create(&attrs(json!({
        "name": name,
        "password": password,
        "email": names::email(&name),
        "description": names::description(),
        "enabled": true,
        "default_project_id": project.id,
        "domain_id": domain,
    })))?;

    let grant = attrs(json!({ "project_id": project.id, "role": "admin" }));
    if let Err(e) = ctx
        .keeper
        .admin()
        .resource(ResourceKind::User)
        .and_then(|admin| admin.perform(&user.id, "grant_role", &grant))
    {
        warn!(user = %user.id, project = %project.id, error = %e, "role grant failed");
    }

    ctx.keeper.store().put(
        &Namespace::credentials(),
        &name,
        Record::Credential(Credential {
            username: name.clone(),
            password,
            project_name: project.name().to_string(),
            user_domain_id: domain.clone(),
            project_domain_id: domain,
            auth_url: ctx.keeper.settings().auth_url.clone(),
            created_at: Utc::now(),
        }),
    )?;
    info!(id = %user.id, %name, project = %project.id, "created user");
    Ok(Outcome::Created(user))
}

/// Rename a user and rotate its password; the credential record follows.
fn update_user(ctx: &ActionContext<'_>) -> Result<Outcome> {
    let id = ctx.target(ResourceKind::User)?;
    let user = ctx.lookup(ResourceKind::User, &id)?;
    let users = ctx.api(ResourceKind::User)?;
    let name = ctx.fresh_name(users.as_ref())?;
    let password = names::password();
    let updated = users.update(
        &id,
        &attrs(json!({
            "name": name,
            "password": password,
            "email": names::email(&name),
            "description": names::description(),
        })),
    )?;

    let store = ctx.keeper.store();
    let ns = Namespace::credentials();
    match store.get(&ns, user.name()) {
        Ok(Record::Credential(mut credential)) => {
            store.rename(&ns, user.name(), &name)?;
            credential.username = name.clone();
            credential.password = password;
            store.put(&ns, &name, Record::Credential(credential))?;
        }
        Ok(_) | Err(SpamError::NotFound { .. }) => {
            debug!(user = %id, "no credential to move");
        }
        Err(e) => return Err(e),
    }
    info!(%id, from = user.name(), to = %name, "renamed user");
    Ok(Outcome::Updated(updated))
}

fn delete_user(ctx: &ActionContext<'_>) -> Result<Outcome> {
    let id = ctx.target(ResourceKind::User)?;
    let user = ctx.lookup(ResourceKind::User, &id)?;
    let outcome = delete_id(ctx, ResourceKind::User, id)?;
    if matches!(outcome, Outcome::Deleted(_)) {
        match ctx
            .keeper
            .store()
            .delete(&Namespace::credentials(), user.name())
        {
            Ok(()) | Err(SpamError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(outcome)
}

/// A project whose quotas are lifted right away.
fn create_project(ctx: &ActionContext<'_>) -> Result<Outcome> {
    let outcome = create_named(ctx, ResourceKind::Project, |_| {
        attrs(json!({
            "description": names::description(),
            "enabled": true,
            "domain_id": "default",
        }))
    })?;
    if let Outcome::Created(project) = &outcome {
        ctx.keeper.lift_quotas(&project.id);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionSet;
    use crate::api::Connector;
    use crate::testing::Fixture;
    use crate::types::Collection;

    fn run(fx: &Fixture, kind: &str, verb: &str) -> Outcome {
        let set = ActionSet::default();
        let action = set
            .resolve(Collection::Identity, &[kind.to_string(), verb.to_string()])
            .unwrap();
        let ctx = ActionContext::new(&fx.keeper, fx.admin.as_ref());
        set.invoke(action, &ctx).unwrap()
    }

    #[test]
    fn created_user_can_log_in_with_its_credential() {
        let fx = Fixture::new();
        let Outcome::Created(user) = run(&fx, "users", "create") else {
            panic!("user not created");
        };
        let credential = fx
            .store
            .get(&Namespace::credentials(), user.name())
            .unwrap()
            .as_credential()
            .cloned()
            .unwrap();
        assert_eq!(credential.project_name, "admin");
        assert!(fx.cloud.connect(&credential).is_ok());

        let remote = fx
            .cloud
            .objects(ResourceKind::User)
            .into_iter()
            .find(|u| u.id == user.id)
            .unwrap();
        assert_eq!(remote.attr("roles").and_then(|r| r.as_array()).map(Vec::len), Some(1));
    }

    #[test]
    fn user_update_moves_the_credential() {
        let fx = Fixture::new();
        let Outcome::Created(user) = run(&fx, "users", "create") else {
            panic!("user not created");
        };
        let Outcome::Updated(renamed) = run(&fx, "users", "update") else {
            panic!("user not updated");
        };
        assert_eq!(renamed.id, user.id);

        let ns = Namespace::credentials();
        assert!(!fx.store.contains(&ns, user.name()).unwrap());
        let credential = fx.store.get(&ns, renamed.name()).unwrap();
        let credential = credential.as_credential().unwrap();
        assert!(fx.cloud.connect(credential).is_ok());
    }

    #[test]
    fn user_delete_drops_credential_and_never_touches_admin() {
        let fx = Fixture::new();
        assert!(matches!(run(&fx, "users", "delete"), Outcome::Skipped(_)));

        let Outcome::Created(user) = run(&fx, "users", "create") else {
            panic!("user not created");
        };
        assert_eq!(run(&fx, "users", "delete"), Outcome::Deleted(user.id.clone()));
        assert!(!fx
            .store
            .contains(&Namespace::credentials(), user.name())
            .unwrap());
        assert!(fx.store.contains(&Namespace::credentials(), "admin").unwrap());
    }
}
