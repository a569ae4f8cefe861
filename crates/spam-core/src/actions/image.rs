use serde_json::json;
use tracing::warn;

use super::{attrs, create_named, delete_random, rename, ActionContext, ActionSpec, Effect, Outcome};
use crate::error::Result;
use crate::types::{Attrs, ResourceKind};

pub(super) fn actions() -> Vec<ActionSpec> {
    vec![
        action! {
            kind: ResourceKind::Image,
            verb: "create",
            handler: create_image,
            effect: Effect::Register(ResourceKind::Image)
        },
        action! {
            kind: ResourceKind::Image,
            verb: "update",
            handler: |ctx| rename(ctx, ResourceKind::Image),
            effect: Effect::Register(ResourceKind::Image)
        },
        action! {
            kind: ResourceKind::Image,
            verb: "delete",
            handler: |ctx| delete_random(ctx, ResourceKind::Image),
            effect: Effect::Deregister(ResourceKind::Image)
        },
    ]
}

/// Register an image record and upload empty data to it. The image exists
/// remotely once created, so a failed upload is only logged.
fn create_image(ctx: &ActionContext<'_>) -> Result<Outcome> {
    let outcome = create_named(ctx, ResourceKind::Image, |_| {
        attrs(json!({
            "disk_format": "raw",
            "container_format": "bare",
            "visibility": "private",
        }))
    })?;
    if let Outcome::Created(image) = &outcome {
        let uploaded = ctx
            .api(ResourceKind::Image)
            .and_then(|api| api.perform(&image.id, "upload", &Attrs::new()));
        if let Err(e) = uploaded {
            warn!(image = %image.id, error = %e, "upload failed");
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionSet;
    use crate::testing::Fixture;
    use crate::types::Collection;

    #[test]
    fn image_is_uploaded_and_base_image_survives_deletes() {
        let fx = Fixture::new();
        let set = ActionSet::default();
        let ctx = ActionContext::new(&fx.keeper, fx.admin.as_ref());
        let create = set
            .resolve(Collection::Image, &["images".to_string(), "create".to_string()])
            .unwrap();
        let delete = set
            .resolve(Collection::Image, &["images".to_string(), "delete".to_string()])
            .unwrap();

        let Outcome::Created(image) = set.invoke(create, &ctx).unwrap() else {
            panic!("image not created");
        };
        let remote = fx
            .cloud
            .objects(ResourceKind::Image)
            .into_iter()
            .find(|i| i.id == image.id)
            .unwrap();
        assert_eq!(remote.str_attr("status"), Some("active"));

        assert_eq!(set.invoke(delete, &ctx).unwrap(), Outcome::Deleted(image.id));
        assert!(matches!(set.invoke(delete, &ctx).unwrap(), Outcome::Skipped(_)));
        assert_eq!(fx.cloud.objects(ResourceKind::Image).len(), 1);
    }
}
