//! Where runs go.
//!
//! The tracer only needs the two calls of [`RunSink`]. Delivery is best effort: the tracer logs
//! sink errors and never retries or propagates them, so a failing sink can never change the
//! outcome of a traced operation.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    api::{Run, RunId, RunPatch},
    context::Context,
};

pub mod background;
pub mod log;
pub mod memory;

pub use background::{BackgroundSink, BackgroundSinkHandle};
pub use log::LogSink;
pub use memory::{RecordingSink, SinkCall};

#[derive(Debug, Error)]
pub enum SinkError {
    /// The caller's context was cancelled before the sink call finished.
    #[error("Sink call cancelled")]
    Cancelled,

    /// The sink no longer accepts calls.
    #[error("Sink is closed")]
    Closed,

    #[error("Failed to encode run for the sink")]
    Encode(#[from] serde_json::Error),

    /// Errors that it is assumed there is no way to handle without human intervention, meant for
    /// consumers to just print and carry on.
    #[error(transparent)]
    UnexpectedFailure(#[from] anyhow::Error),
}

/// Accepts run creations and updates.
///
/// Implementations must be safe to call concurrently from many spans. A sink may receive a run
/// whose parent has not been created yet (streaming spans create their run late) and must tolerate
/// that.
#[async_trait]
pub trait RunSink: Send + Sync {
    /// Store a new run. A sink may echo back the stored run with server-generated fields filled
    /// in; the tracer accepts it but keeps using the id it minted.
    async fn create_run(&self, ctx: &Context, run: &Run) -> Result<Option<Run>, SinkError>;

    /// Apply the end-of-span patch to a run.
    async fn update_run(
        &self,
        ctx: &Context,
        run_id: RunId,
        patch: &RunPatch,
    ) -> Result<(), SinkError>;
}

#[async_trait]
impl<S: RunSink + ?Sized> RunSink for Arc<S> {
    async fn create_run(&self, ctx: &Context, run: &Run) -> Result<Option<Run>, SinkError> {
        (**self).create_run(ctx, run).await
    }

    async fn update_run(
        &self,
        ctx: &Context,
        run_id: RunId,
        patch: &RunPatch,
    ) -> Result<(), SinkError> {
        (**self).update_run(ctx, run_id, patch).await
    }
}

#[async_trait]
impl<S: RunSink + ?Sized> RunSink for Box<S> {
    async fn create_run(&self, ctx: &Context, run: &Run) -> Result<Option<Run>, SinkError> {
        (**self).create_run(ctx, run).await
    }

    async fn update_run(
        &self,
        ctx: &Context,
        run_id: RunId,
        patch: &RunPatch,
    ) -> Result<(), SinkError> {
        (**self).update_run(ctx, run_id, patch).await
    }
}
