//! Managed run lifecycle bracketing for patch implementations.
//!
//! A patch installed with `manage_run` gets its implementation wrapped so
//! that a tracked run exists while instrumentation executes: if no run is
//! active at entry one is started and finalized (`SUCCEEDED` on success,
//! `FAILED` on error) when the implementation completes. A run that was
//! already active at entry is never touched.

use std::sync::Arc;

use crate::client::{RunId, RunStatus, TrackingClient, best_effort};
use crate::patch::{CallOriginal, PatchImpl, PatchUnit};
use crate::value::{ArgValue, CallArgs};

/// Wrap a patch implementation with run-lifecycle bracketing, preserving
/// its protocol (plain function or stateful unit).
pub fn with_managed_run(client: Arc<dyn TrackingClient>, patch_impl: PatchImpl) -> PatchImpl {
    match patch_impl {
        PatchImpl::Function(inner) => PatchImpl::function(move |original, args| {
            let owned_run = start_run_if_none_active(&client)?;
            match inner(original, args) {
                Ok(value) => {
                    if owned_run.is_some() {
                        best_effort("end_run", || client.end_run(RunStatus::Succeeded))?;
                    }
                    Ok(value)
                }
                Err(e) => {
                    if owned_run.is_some() {
                        // The inner failure is re-raised unconditionally; a
                        // failing end_run call must not mask it.
                        let _ = best_effort("end_run", || client.end_run(RunStatus::Failed));
                    }
                    Err(e)
                }
            }
        }),
        PatchImpl::Unit(factory) => {
            let client = Arc::clone(&client);
            PatchImpl::unit(move || {
                Box::new(ManagedRunUnit {
                    client: Arc::clone(&client),
                    inner: factory(),
                    owned_run: None,
                })
            })
        }
    }
}

/// Start a run when none is active; `Some` marks ownership of the new run.
///
/// A swallowed start failure (normal mode) yields `None`: nothing was
/// started, so nothing will be finalized.
fn start_run_if_none_active(
    client: &Arc<dyn TrackingClient>,
) -> anyhow::Result<Option<RunId>> {
    if client.active_run().is_some() {
        return Ok(None);
    }
    Ok(best_effort("start_run", || client.start_run())?)
}

struct ManagedRunUnit {
    client: Arc<dyn TrackingClient>,
    inner: Box<dyn PatchUnit>,
    owned_run: Option<RunId>,
}

impl PatchUnit for ManagedRunUnit {
    fn run(&mut self, original: &mut CallOriginal<'_>, args: &CallArgs) -> anyhow::Result<ArgValue> {
        self.owned_run = start_run_if_none_active(&self.client)?;
        let result = self.inner.run(original, args)?;
        if self.owned_run.is_some() {
            best_effort("end_run", || self.client.end_run(RunStatus::Succeeded))?;
        }
        Ok(result)
    }

    fn on_failure(&mut self, error: &anyhow::Error) {
        if self.owned_run.is_some() {
            let _ = best_effort("end_run", || self.client.end_run(RunStatus::Failed));
        }
        self.inner.on_failure(error);
    }
}
