use rand::seq::SliceRandom;
use serde_json::{json, Value};

use super::{attrs, create_named, delete_random, empty, rename, ActionContext, ActionSpec, Effect, Outcome};
use crate::error::Result;
use crate::keeper::Probe;
use crate::types::ResourceKind;

const FLAVOR_RAM_MB: &[u64] = &[64, 128, 256, 512];

pub(super) fn actions() -> Vec<ActionSpec> {
    vec![
        action! {
            kind: ResourceKind::Flavor,
            verb: "create",
            handler: create_flavor,
            effect: Effect::Register(ResourceKind::Flavor)
        },
        action! {
            kind: ResourceKind::Flavor,
            verb: "delete",
            handler: |ctx| delete_random(ctx, ResourceKind::Flavor),
            effect: Effect::Deregister(ResourceKind::Flavor)
        },
        action! {
            kind: ResourceKind::Server,
            verb: "create",
            handler: create_server,
            effect: Effect::Register(ResourceKind::Server)
        },
        action! {
            kind: ResourceKind::Server,
            verb: "update",
            handler: |ctx| rename(ctx, ResourceKind::Server),
            effect: Effect::Register(ResourceKind::Server)
        },
        action! {
            kind: ResourceKind::Server,
            verb: "delete",
            handler: |ctx| delete_random(ctx, ResourceKind::Server),
            effect: Effect::Deregister(ResourceKind::Server)
        },
    ]
}

fn create_flavor(ctx: &ActionContext<'_>) -> Result<Outcome> {
    let ram = FLAVOR_RAM_MB
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(64);
    create_named(ctx, ResourceKind::Flavor, |_| {
        attrs(json!({ "ram": ram, "vcpus": 1, "disk": 1 }))
    })
}

/// A server from a random tracked image and flavor, plugged into any
/// network that has at least one subnet.
fn create_server(ctx: &ActionContext<'_>) -> Result<Outcome> {
    let image_id = ctx.pick(ResourceKind::Image)?;
    let image = ctx.lookup(ResourceKind::Image, &image_id)?;
    let flavor_id = ctx.pick(ResourceKind::Flavor)?;
    let flavor = ctx.lookup(ResourceKind::Flavor, &flavor_id)?;

    let networks = ctx.keeper.query(
        ctx.cloud,
        ResourceKind::Network,
        Probe::Children {
            kind: ResourceKind::Subnet,
            parent_key: "network_id",
        },
        |subnets| subnets.as_array().is_some_and(|s| !s.is_empty()),
    );
    let network = networks
        .choose(&mut rand::thread_rng())
        .ok_or_else(|| empty(ResourceKind::Network))?;

    create_named(ctx, ResourceKind::Server, |_| {
        attrs(json!({
            "imageRef": image.id,
            "flavorRef": flavor.id,
            "networks": [{ "uuid": network.id }],
            "metadata": Value::Object(Default::default()),
        }))
    })
}
