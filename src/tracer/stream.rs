//! Spans whose input or output arrives as a stream.
//!
//! The stream is handed over to a background task that drains it, folds the chunks with an
//! [`Aggregate`], and only then talks to the sink. The caller never waits for the drain: the
//! streaming input span's identity and dotted order are fixed before returning, so children
//! started while the input is still flowing link to it correctly, even though its run reaches the
//! sink after theirs.
//!
//! The stream is released (dropped) on every exit path: right after draining, on a stream error,
//! on a panic, or immediately when the span is not traced. Use [`Tracer::flush`] to wait for
//! outstanding drains.
//!
//! Both operations spawn onto the current tokio runtime and panic when called outside of one.

use std::pin::Pin;

use futures::{Stream, StreamExt};

use crate::{
    api::{JsonMap, RunId, RunInfo, RunPatch},
    context::{current_run_id, Context},
    ordering::monotonic_now,
    tracer::{open, Aggregate, Aggregated, Tracer},
};

/// The input key of a streaming run.
pub const STREAM_INPUTS_KEY: &str = "stream_inputs";
/// The output key of a streaming run.
pub const STREAM_OUTPUTS_KEY: &str = "stream_outputs";
/// Where the summed token usage of a streaming output is reported in the run's extra.
pub const MODEL_USAGE_KEY: &str = "model_usage";

/// Owns a stream for the duration of a drain.
struct StreamGuard<S> {
    stream: Pin<Box<S>>,
    run_id: RunId,
    direction: &'static str,
}

impl<S> StreamGuard<S> {
    fn new(stream: S, run_id: RunId, direction: &'static str) -> Self {
        StreamGuard {
            stream: Box::pin(stream),
            run_id,
            direction,
        }
    }
}

impl<S> Drop for StreamGuard<S> {
    fn drop(&mut self) {
        tracing::trace!(run_id = %self.run_id, direction = self.direction, "Released stream");
    }
}

/// Read every chunk, stopping at the first error. The stream is released before returning.
async fn drain<S, T, E>(mut guard: StreamGuard<S>) -> Result<Vec<T>, E>
where
    S: Stream<Item = Result<T, E>>,
{
    let mut chunks = Vec::new();
    while let Some(chunk) = guard.stream.next().await {
        chunks.push(chunk?);
    }
    Ok(chunks)
}

impl Tracer {
    /// Enter a span whose input is a stream.
    ///
    /// The run's id, start time and dotted order are fixed now and published on the returned
    /// context. Its creation is deferred to a background task: once `stream` has ended, the
    /// chunks are folded with `aggregator` and the run is created with the aggregate stored
    /// under `stream_inputs`. If the stream yields an error or the aggregation fails, the run is
    /// abandoned and never created.
    ///
    /// The deferred creation follows `ctx`'s cancellation.
    pub fn start_span_with_stream_input<S, T, E, A>(
        &self,
        ctx: &Context,
        info: Option<&RunInfo>,
        stream: S,
        aggregator: A,
    ) -> Context
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        A: Aggregate<T>,
    {
        let Some(info) = self.traced(info) else {
            drop(stream);
            return ctx.clone();
        };

        let (child, span) = open(ctx);
        let guard = StreamGuard::new(stream, span.run_id, "input");
        let tracer = self.clone();
        let info = info.clone();
        let task_ctx = child.clone();

        self.spawn_contained(span.run_id, "stream input", async move {
            let chunks = match drain(guard).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    tracing::warn!(
                        err = &e as &dyn std::error::Error,
                        run_id = %span.run_id,
                        "Failed to receive stream input, abandoning run"
                    );
                    return;
                }
            };

            let Aggregated { payload, extra, .. } = match aggregator.aggregate(chunks) {
                Ok(agg) => agg,
                Err(e) => {
                    tracing::warn!(
                        err = &e as &dyn std::error::Error,
                        run_id = %span.run_id,
                        "Failed to aggregate stream input, abandoning run"
                    );
                    return;
                }
            };

            let mut inputs = JsonMap::new();
            inputs.insert(STREAM_INPUTS_KEY.to_owned(), payload);
            let run = tracer.build_run(&task_ctx, &info, &span, inputs, extra);
            tracer.create(&task_ctx, &run).await;
        });

        child
    }

    /// Exit the span `ctx` belongs to with an output that is a stream.
    ///
    /// Returns immediately. A background task drains `stream`, folds it with `aggregator`, and
    /// sends one update carrying the aggregate under `stream_outputs`, the aggregate's extra, and
    /// its token usage. A stream error ends the run with that error; a failed aggregation ends it
    /// with its end time only. The update ignores `ctx`'s cancellation.
    pub fn end_span_with_stream_output<S, T, E, A>(
        &self,
        ctx: &Context,
        info: Option<&RunInfo>,
        stream: S,
        aggregator: A,
    ) -> Context
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        A: Aggregate<T>,
    {
        let Some(info) = self.traced(info) else {
            drop(stream);
            return ctx.clone();
        };
        let Some(run_id) = current_run_id(ctx) else {
            tracing::warn!(
                name = info.display_name(),
                "No span state in context when ending streaming span"
            );
            drop(stream);
            return ctx.clone();
        };

        let guard = StreamGuard::new(stream, run_id, "output");
        let tracer = self.clone();
        let task_ctx = ctx.detached();

        self.spawn_contained(run_id, "stream output", async move {
            let patch = match drain(guard).await {
                Ok(chunks) => output_patch(run_id, aggregator, chunks),
                Err(e) => {
                    tracing::warn!(
                        err = &e as &dyn std::error::Error,
                        %run_id,
                        "Failed to receive stream output"
                    );
                    RunPatch {
                        error: Some(e.to_string()),
                        ..RunPatch::ended_at(monotonic_now())
                    }
                }
            };
            tracer.update(&task_ctx, run_id, &patch).await;
        });

        ctx.clone()
    }
}

fn output_patch<T, A: Aggregate<T>>(run_id: RunId, aggregator: A, chunks: Vec<T>) -> RunPatch {
    let Aggregated {
        payload,
        mut extra,
        usage,
    } = match aggregator.aggregate(chunks) {
        Ok(agg) => agg,
        Err(e) => {
            tracing::warn!(
                err = &e as &dyn std::error::Error,
                %run_id,
                "Failed to aggregate stream output, recording end time only"
            );
            return RunPatch::ended_at(monotonic_now());
        }
    };

    let mut outputs = JsonMap::new();
    outputs.insert(STREAM_OUTPUTS_KEY.to_owned(), payload);
    let mut patch = RunPatch {
        outputs: Some(outputs),
        ..RunPatch::ended_at(monotonic_now())
    };
    if let Some(usage) = usage {
        if !extra.contains_key(MODEL_USAGE_KEY) {
            if let Ok(v) = serde_json::to_value(usage) {
                extra.insert(MODEL_USAGE_KEY.to_owned(), v);
            }
        }
        patch = patch.with_usage(usage);
    }
    if !extra.is_empty() {
        patch.extra = Some(extra);
    }
    patch
}
