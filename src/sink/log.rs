use async_trait::async_trait;

use crate::{
    api::{Run, RunId, RunPatch},
    context::Context,
    sink::{RunSink, SinkError},
};

/// A sink that writes every call to the `tracing` log at info level and stores nothing.
///
/// Inputs, outputs and extra are logged as JSON strings.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        LogSink
    }
}

#[async_trait]
impl RunSink for LogSink {
    async fn create_run(&self, _ctx: &Context, run: &Run) -> Result<Option<Run>, SinkError> {
        let inputs = serde_json::to_string(&run.inputs)?;
        let extra = serde_json::to_string(&run.extra)?;
        tracing::info!(
            run_id = %run.id,
            trace_id = %run.trace_id,
            parent_run_id = run.parent_run_id.map(tracing::field::display),
            name = %run.name,
            run_type = %run.run_type,
            dotted_order = %run.dotted_order,
            session_name = run.session_name.as_deref(),
            tags = ?run.tags,
            inputs = %inputs,
            extra = %extra,
            "create run"
        );
        Ok(None)
    }

    async fn update_run(
        &self,
        _ctx: &Context,
        run_id: RunId,
        patch: &RunPatch,
    ) -> Result<(), SinkError> {
        let outputs = patch
            .outputs
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        tracing::info!(
            %run_id,
            end_time = patch.end_time.map(|t| tracing::field::display(t.to_rfc3339())),
            outputs = outputs.as_deref(),
            error = patch.error.as_deref(),
            total_tokens = patch.total_tokens,
            "update run"
        );
        Ok(())
    }
}
