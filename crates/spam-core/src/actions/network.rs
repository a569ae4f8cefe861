use rand::Rng;
use serde_json::json;

use super::{attrs, create_named, delete_random, rename, ActionContext, ActionSpec, Effect, Outcome};
use crate::error::{Result, SpamError};
use crate::subnet::{self, Block, MAX_PREFIX, MIN_PREFIX, POOL};
use crate::types::ResourceKind;

pub(super) fn actions() -> Vec<ActionSpec> {
    let mut specs = vec![
        action! {
            kind: ResourceKind::Network,
            verb: "create",
            handler: |ctx| create_named(ctx, ResourceKind::Network, |_| {
                attrs(json!({ "admin_state_up": true }))
            }),
            effect: Effect::Register(ResourceKind::Network)
        },
        action! {
            kind: ResourceKind::Router,
            verb: "create",
            handler: |ctx| create_named(ctx, ResourceKind::Router, |_| {
                attrs(json!({ "admin_state_up": true }))
            }),
            effect: Effect::Register(ResourceKind::Router)
        },
        action! {
            kind: ResourceKind::Subnet,
            verb: "create",
            handler: create_subnet,
            effect: Effect::Register(ResourceKind::Subnet)
        },
        action! {
            kind: ResourceKind::Port,
            verb: "create",
            handler: create_port,
            effect: Effect::Register(ResourceKind::Port)
        },
    ];

    // update and delete behave the same for every network kind
    specs.extend([
        action! {
            kind: ResourceKind::Network,
            verb: "update",
            handler: |ctx| rename(ctx, ResourceKind::Network),
            effect: Effect::Register(ResourceKind::Network)
        },
        action! {
            kind: ResourceKind::Network,
            verb: "delete",
            handler: |ctx| delete_random(ctx, ResourceKind::Network),
            effect: Effect::Deregister(ResourceKind::Network)
        },
        action! {
            kind: ResourceKind::Subnet,
            verb: "update",
            handler: |ctx| rename(ctx, ResourceKind::Subnet),
            effect: Effect::Register(ResourceKind::Subnet)
        },
        action! {
            kind: ResourceKind::Subnet,
            verb: "delete",
            handler: |ctx| delete_random(ctx, ResourceKind::Subnet),
            effect: Effect::Deregister(ResourceKind::Subnet)
        },
        action! {
            kind: ResourceKind::Router,
            verb: "update",
            handler: |ctx| rename(ctx, ResourceKind::Router),
            effect: Effect::Register(ResourceKind::Router)
        },
        action! {
            kind: ResourceKind::Router,
            verb: "delete",
            handler: |ctx| delete_random(ctx, ResourceKind::Router),
            effect: Effect::Deregister(ResourceKind::Router)
        },
        action! {
            kind: ResourceKind::Port,
            verb: "update",
            handler: |ctx| rename(ctx, ResourceKind::Port),
            effect: Effect::Register(ResourceKind::Port)
        },
        action! {
            kind: ResourceKind::Port,
            verb: "delete",
            handler: |ctx| delete_random(ctx, ResourceKind::Port),
            effect: Effect::Deregister(ResourceKind::Port)
        },
    ]);
    specs
}

/// A subnet on a random tracked network, carved from free pool space that
/// overlaps none of that network's subnets.
fn create_subnet(ctx: &ActionContext<'_>) -> Result<Outcome> {
    let network_id = ctx.pick(ResourceKind::Network)?;
    let network = ctx.lookup(ResourceKind::Network, &network_id)?;
    let taken: Vec<Block> = ctx
        .api(ResourceKind::Subnet)?
        .list()?
        .iter()
        .filter(|s| s.str_attr("network_id") == Some(network.id.as_str()))
        .filter_map(|s| s.str_attr("cidr")?.parse().ok())
        .collect();
    let prefix = rand::thread_rng().gen_range(MIN_PREFIX..=MAX_PREFIX);
    let cidr = subnet::allocate(&taken, prefix)
        .ok_or_else(|| SpamError::EmptySelection(format!("free /{prefix} in {POOL}")))?;

    create_named(ctx, ResourceKind::Subnet, |_| {
        attrs(json!({
            "network_id": network.id,
            "cidr": cidr.to_string(),
            "ip_version": 4,
            "enable_dhcp": false,
        }))
    })
}

fn create_port(ctx: &ActionContext<'_>) -> Result<Outcome> {
    let network_id = ctx.pick(ResourceKind::Network)?;
    let network = ctx.lookup(ResourceKind::Network, &network_id)?;
    create_named(ctx, ResourceKind::Port, |_| {
        attrs(json!({ "network_id": network.id, "admin_state_up": true }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionSet;
    use crate::testing::Fixture;
    use crate::types::Collection;

    fn run(fx: &Fixture, kind: &str, verb: &str) -> Outcome {
        let set = ActionSet::default();
        let action = set
            .resolve(Collection::Network, &[kind.to_string(), verb.to_string()])
            .unwrap();
        let ctx = crate::actions::ActionContext::new(&fx.keeper, fx.admin.as_ref());
        set.invoke(action, &ctx).unwrap()
    }

    #[test]
    fn subnet_without_network_is_skipped() {
        let fx = Fixture::new();
        assert!(matches!(run(&fx, "subnets", "create"), Outcome::Skipped(_)));
        assert!(fx.cloud.objects(ResourceKind::Subnet).is_empty());
    }

    #[test]
    fn subnets_on_one_network_never_overlap() {
        let fx = Fixture::new();
        assert!(matches!(run(&fx, "networks", "create"), Outcome::Created(_)));
        for _ in 0..6 {
            assert!(matches!(run(&fx, "subnets", "create"), Outcome::Created(_)));
        }

        let blocks: Vec<Block> = fx
            .cloud
            .objects(ResourceKind::Subnet)
            .iter()
            .map(|s| s.str_attr("cidr").unwrap().parse().unwrap())
            .collect();
        assert_eq!(blocks.len(), 6);
        for (i, a) in blocks.iter().enumerate() {
            assert!(POOL.overlaps(a));
            for b in &blocks[i + 1..] {
                assert!(!a.overlaps(b), "{a} overlaps {b}");
            }
        }
        assert_eq!(fx.store.len(&ResourceKind::Subnet.namespace()).unwrap(), 6);
    }

    #[test]
    fn network_with_subnet_fails_to_delete_and_stays_tracked() {
        let fx = Fixture::new();
        run(&fx, "networks", "create");
        run(&fx, "subnets", "create");

        assert!(matches!(run(&fx, "networks", "delete"), Outcome::Failed(_)));
        assert_eq!(fx.store.len(&ResourceKind::Network.namespace()).unwrap(), 1);

        assert!(matches!(run(&fx, "subnets", "delete"), Outcome::Deleted(_)));
        assert!(matches!(run(&fx, "networks", "delete"), Outcome::Deleted(_)));
        assert_eq!(fx.store.len(&ResourceKind::Network.namespace()).unwrap(), 0);
    }

    #[test]
    fn port_lands_on_tracked_network() {
        let fx = Fixture::new();
        let Outcome::Created(net) = run(&fx, "networks", "create") else {
            panic!("network not created");
        };
        let Outcome::Created(port) = run(&fx, "ports", "create") else {
            panic!("port not created");
        };
        assert_eq!(port.str_attr("network_id"), Some(net.id.as_str()));
        assert!(matches!(run(&fx, "ports", "update"), Outcome::Updated(_)));
    }
}
