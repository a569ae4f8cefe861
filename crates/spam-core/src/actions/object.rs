use super::{attrs, create_named, delete_random, ActionSpec, Effect};
use crate::types::ResourceKind;

pub(super) fn actions() -> Vec<ActionSpec> {
    vec![
        action! {
            kind: ResourceKind::Container,
            verb: "create",
            handler: |ctx| create_named(ctx, ResourceKind::Container, |_| attrs(serde_json::json!({}))),
            effect: Effect::Register(ResourceKind::Container)
        },
        action! {
            kind: ResourceKind::Container,
            verb: "delete",
            handler: |ctx| delete_random(ctx, ResourceKind::Container),
            effect: Effect::Deregister(ResourceKind::Container)
        },
    ]
}
