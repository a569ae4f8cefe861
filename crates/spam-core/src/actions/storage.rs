use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};
use tracing::info;

use super::{
    attrs, create_named, delete_id, empty, rename, ActionContext, ActionSpec, Effect, Outcome,
};
use crate::error::Result;
use crate::names;
use crate::types::{Attrs, ResourceKind};

/// Volume sizes in GiB.
const SIZES: &[u64] = &[1, 2, 5, 10, 20, 40, 50];

pub(super) fn actions() -> Vec<ActionSpec> {
    vec![
        action! {
            kind: ResourceKind::Volume,
            verb: "create",
            handler: create_volume,
            effect: Effect::Register(ResourceKind::Volume)
        },
        action! {
            kind: ResourceKind::Volume,
            verb: "update",
            handler: |ctx| rename(ctx, ResourceKind::Volume),
            effect: Effect::Register(ResourceKind::Volume)
        },
        action! {
            kind: ResourceKind::Volume,
            verb: "extend",
            handler: extend_volume
        },
        action! {
            kind: ResourceKind::Volume,
            verb: "attach",
            handler: attach_volume
        },
        action! {
            kind: ResourceKind::Volume,
            verb: "detach",
            handler: detach_volume
        },
        action! {
            kind: ResourceKind::Volume,
            verb: "delete",
            handler: delete_volume,
            effect: Effect::Deregister(ResourceKind::Volume)
        },
    ]
}

fn create_volume(ctx: &ActionContext<'_>) -> Result<Outcome> {
    let size = SIZES.choose(&mut rand::thread_rng()).copied().unwrap_or(1);
    create_named(ctx, ResourceKind::Volume, |_| {
        attrs(json!({ "size": size, "description": names::description() }))
    })
}

fn extend_volume(ctx: &ActionContext<'_>) -> Result<Outcome> {
    let id = ctx.target(ResourceKind::Volume)?;
    let volume = ctx.lookup(ResourceKind::Volume, &id)?;
    let size = volume.attr("size").and_then(Value::as_u64).unwrap_or(1);
    let new_size = size + rand::thread_rng().gen_range(1..=10);
    ctx.api(ResourceKind::Volume)?.perform(
        &id,
        "extend",
        &attrs(json!({ "new_size": new_size })),
    )?;
    info!(volume = %id, size, new_size, "extended volume");
    Ok(Outcome::Changed(id))
}

/// Claim an unused volume and attach it to a random tracked server. The
/// claim is rolled back when anything after it fails.
fn attach_volume(ctx: &ActionContext<'_>) -> Result<Outcome> {
    let id = ctx
        .keeper
        .pick_unused(ResourceKind::Volume)?
        .ok_or_else(|| empty(ResourceKind::Volume))?;

    let attached = (|| -> Result<Outcome> {
        let server_id = ctx.pick(ResourceKind::Server)?;
        ctx.lookup(ResourceKind::Server, &server_id)?;
        ctx.lookup(ResourceKind::Volume, &id)?;
        ctx.api(ResourceKind::Volume)?.perform(
            &id,
            "attach",
            &attrs(json!({ "server_id": server_id })),
        )?;
        info!(volume = %id, server = %server_id, "attached volume");
        Ok(Outcome::Changed(id.clone()))
    })();

    if attached.is_err() {
        ctx.restore(ResourceKind::Volume, &id, false)?;
    }
    attached
}

/// Claim a used volume and detach it. A volume that is already available
/// remotely stays released.
fn detach_volume(ctx: &ActionContext<'_>) -> Result<Outcome> {
    let id = ctx
        .keeper
        .pick_used(ResourceKind::Volume)?
        .ok_or_else(|| empty(ResourceKind::Volume))?;

    let detached = ctx
        .api(ResourceKind::Volume)
        .and_then(|api| api.perform(&id, "detach", &Attrs::new()));
    match detached {
        Ok(_) => {
            info!(volume = %id, "detached volume");
            Ok(Outcome::Changed(id))
        }
        Err(e) => {
            let available = ctx
                .lookup(ResourceKind::Volume, &id)
                .map(|v| v.str_attr("status") == Some("available"))
                .unwrap_or(false);
            if !available {
                ctx.restore(ResourceKind::Volume, &id, true)?;
            }
            Err(e)
        }
    }
}

/// Delete a random volume that is not attached.
fn delete_volume(ctx: &ActionContext<'_>) -> Result<Outcome> {
    let id = ctx
        .keeper
        .pick_target_where(ResourceKind::Volume, |r| r.used() == Some(false))?
        .ok_or_else(|| empty(ResourceKind::Volume))?;
    delete_id(ctx, ResourceKind::Volume, id)
}
