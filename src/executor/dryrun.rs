//! Executor that only reports what would be done.

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::info;

use super::{Executor, PhaseContext};
use crate::error::CuoError;

pub struct DryRunExecutor;

impl DryRunExecutor {
    fn report(ctx: &PhaseContext, action: &str) {
        let server = ctx
            .exec_server()
            .map_or_else(|| "-".to_string(), |s| s.hostname.clone());
        info!(
            phase = %ctx.path,
            kind = %ctx.kind,
            server = %server,
            "[DRY RUN] Would {action} phase"
        );
    }
}

impl Executor for DryRunExecutor {
    fn name(&self) -> &'static str {
        "dryrun"
    }

    fn execute<'a>(&'a self, ctx: &'a PhaseContext) -> BoxFuture<'a, Result<(), CuoError>> {
        Self::report(ctx, "execute");
        futures::future::ready(Ok(())).boxed()
    }

    fn rollback<'a>(&'a self, ctx: &'a PhaseContext) -> BoxFuture<'a, Result<(), CuoError>> {
        Self::report(ctx, "roll back");
        futures::future::ready(Ok(())).boxed()
    }
}
