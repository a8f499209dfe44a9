use crate::context::Context;
use crate::core::Dynamic;
use crate::deletion::Deletion;
use crate::engine::{AnyTask, Delta};
use crate::error::TaskError;
use crate::target::Target;

/// Changes the cloud through each task's own API calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectTarget;

impl<C> Target<C> for DirectTarget {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn render(
        &self,
        ctx: &Context<'_, C>,
        task: &dyn AnyTask<C>,
        desired: &Dynamic,
        actual: Option<&Dynamic>,
        delta: &Delta,
    ) -> Result<Option<Dynamic>, TaskError> {
        task.render_direct(ctx, desired, actual, delta).map(Some)
    }

    fn delete(&self, ctx: &Context<'_, C>, deletion: &Deletion<C>) -> Result<(), TaskError> {
        deletion.inventory().delete(ctx, deletion.resource())
    }
}
