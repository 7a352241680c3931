//! The span lifecycle.
//!
//! A [`Tracer`] turns span entries and exits into run creations and updates on a [`RunSink`].
//! Every entry mints a fresh run id, composes the run's dotted order from the enclosing span's,
//! and publishes the new run as the parent for everything derived from the returned [`Context`].
//!
//! Tracing is best effort throughout: sink failures, encoding failures and missing context state
//! are logged and swallowed, and every operation hands back a usable context.
//!
//! ```no_run
//! # async fn run() {
//! use runlink::{Context, RecordingSink, RunInfo, RunKind, SpanOutcome, Tracer};
//! use std::sync::Arc;
//!
//! let tracer = Tracer::new(Arc::new(RecordingSink::new()));
//! let info = RunInfo::new("graph", RunKind::Chain);
//!
//! let ctx = tracer.start_span(&Context::new(), Some(&info), "question").await;
//! // ... nested spans use `ctx` ...
//! tracer.end_span(&ctx, Some(&info), SpanOutcome::output(&"answer")).await;
//! # }
//! ```

use std::{
    any::Any,
    backtrace::Backtrace,
    collections::BTreeSet,
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::select;
use tokio_util::task::TaskTracker;

use crate::{
    api::{JsonMap, Run, RunId, RunInfo, RunKind, RunPatch},
    config::TracerConfig,
    context::{
        current_run_id, get_or_init_state, publish_state, trace_options, Context, TraceState,
    },
    ordering::{compose_dotted_order, monotonic_now, new_run_id, DottedOrder},
    sink::{RunSink, SinkError},
};

pub mod aggregate;
mod panic;
pub mod stream;

pub use aggregate::{
    from_fn, Aggregate, AggregateError, Aggregated, CollectChunks, FromFn, MessageAggregator,
    MessageChunk,
};

/// The input key of a non-streaming run.
pub const INPUT_KEY: &str = "input";
/// The output key of a non-streaming run.
pub const OUTPUT_KEY: &str = "output";

/// How a span ended.
#[derive(Clone, Debug, PartialEq)]
pub enum SpanOutcome {
    /// The operation produced a value, stored as the run's `output`.
    Output(Value),
    /// The operation failed.
    Error(String),
    /// Record the end time only.
    Finished,
}

impl SpanOutcome {
    /// An output outcome. A value that fails to encode is logged and the span ends with
    /// [`SpanOutcome::Finished`].
    pub fn output<T: Serialize + ?Sized>(output: &T) -> Self {
        match serde_json::to_value(output) {
            Ok(v) => SpanOutcome::Output(v),
            Err(e) => {
                tracing::warn!(
                    err = &e as &dyn std::error::Error,
                    "Failed to encode span output, recording end time only"
                );
                SpanOutcome::Finished
            }
        }
    }

    pub fn error(err: &dyn std::error::Error) -> Self {
        SpanOutcome::Error(err.to_string())
    }

    pub fn from_result<T: Serialize, E: std::error::Error>(result: &Result<T, E>) -> Self {
        match result {
            Ok(v) => SpanOutcome::output(v),
            Err(e) => SpanOutcome::error(e),
        }
    }

    fn into_patch(self, end_time: DateTime<Utc>) -> RunPatch {
        let mut patch = RunPatch::ended_at(end_time);
        match self {
            SpanOutcome::Output(v) => {
                let mut outputs = JsonMap::new();
                outputs.insert(OUTPUT_KEY.to_owned(), v);
                patch.outputs = Some(outputs);
            }
            SpanOutcome::Error(e) => patch.error = Some(e),
            SpanOutcome::Finished => (),
        }
        patch
    }
}

/// A run that has been given its identity but not necessarily sent yet.
#[derive(Clone, Debug)]
struct OpenSpan {
    run_id: RunId,
    trace_id: RunId,
    parent_run_id: Option<RunId>,
    start_time: DateTime<Utc>,
    dotted_order: DottedOrder,
}

/// See the [module docs](self).
///
/// Cheap to clone; clones share the sink, the configuration and the set of background tasks.
#[derive(Clone)]
pub struct Tracer {
    sink: Arc<dyn RunSink>,
    config: Arc<TracerConfig>,
    tasks: TaskTracker,
}

impl Tracer {
    pub fn new<S: RunSink + 'static>(sink: S) -> Self {
        Self::with_config(sink, TracerConfig::default())
    }

    pub fn with_config<S: RunSink + 'static>(sink: S, config: TracerConfig) -> Self {
        panic::install_hook();
        Tracer {
            sink: Arc::new(sink),
            config: Arc::new(config),
            tasks: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    /// Enter a span: create its run and return the context its children must use.
    ///
    /// Returns `ctx` unchanged when `info` is absent or untraced, or when tracing is disabled. The
    /// run creation follows `ctx`'s cancellation; a failed or cancelled creation is logged and the
    /// derived context is still returned.
    pub async fn start_span<I: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        info: Option<&RunInfo>,
        input: &I,
    ) -> Context {
        let Some(info) = self.traced(info) else {
            return ctx.clone();
        };

        let mut inputs = JsonMap::new();
        match serde_json::to_value(input) {
            Ok(v) => {
                inputs.insert(INPUT_KEY.to_owned(), v);
            }
            Err(e) => tracing::warn!(
                err = &e as &dyn std::error::Error,
                name = info.display_name(),
                "Failed to encode span input, omitting it"
            ),
        }

        let (child, span) = open(ctx);
        let run = self.build_run(&child, info, &span, inputs, JsonMap::new());
        self.create(&child, &run).await;
        child
    }

    /// Exit the span `ctx` belongs to, recording `outcome`.
    ///
    /// The update is sent regardless of `ctx`'s cancellation, so an announced run is always
    /// closed.
    pub async fn end_span(
        &self,
        ctx: &Context,
        info: Option<&RunInfo>,
        outcome: SpanOutcome,
    ) -> Context {
        let Some(info) = self.traced(info) else {
            return ctx.clone();
        };
        let Some(run_id) = current_run_id(ctx) else {
            tracing::warn!(
                name = info.display_name(),
                "No span state in context when ending span"
            );
            return ctx.clone();
        };

        let patch = outcome.into_patch(monotonic_now());
        self.update(&ctx.detached(), run_id, &patch).await;
        ctx.clone()
    }

    /// Enter a span outside of any host framework. Pair with [finish_span](Self::finish_span).
    ///
    /// Returns the derived context and the new run's id, or `ctx` unchanged and no id when
    /// tracing is disabled.
    pub async fn start_named_span<S: Into<String>>(
        &self,
        ctx: &Context,
        name: S,
        kind: RunKind,
    ) -> (Context, Option<RunId>) {
        let info = RunInfo::new(name, kind);
        if self.traced(Some(&info)).is_none() {
            return (ctx.clone(), None);
        }

        let (child, span) = open(ctx);
        let run = self.build_run(&child, &info, &span, JsonMap::new(), JsonMap::new());
        self.create(&child, &run).await;
        (child, Some(span.run_id))
    }

    /// Record the end time of a run started with [start_named_span](Self::start_named_span).
    pub async fn finish_span(&self, ctx: &Context, run_id: RunId) {
        if !self.config.enabled() {
            return;
        }
        let patch = RunPatch::ended_at(monotonic_now());
        self.update(&ctx.detached(), run_id, &patch).await;
    }

    /// Wait for every background stream drain started so far to finish.
    pub async fn flush(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    fn traced<'a>(&self, info: Option<&'a RunInfo>) -> Option<&'a RunInfo> {
        info.filter(|info| !info.untraced && self.config.enabled())
    }

    fn build_run(
        &self,
        ctx: &Context,
        info: &RunInfo,
        span: &OpenSpan,
        inputs: JsonMap,
        aggregated_extra: JsonMap,
    ) -> Run {
        let options = trace_options(ctx);

        let session_name = options
            .and_then(|o| o.session_name())
            .or(self.config.session_name())
            .map(str::to_owned);

        let mut tags: BTreeSet<String> = self.config.tags().clone();
        if let Some(o) = options {
            tags.extend(o.tags().iter().cloned());
        }

        let mut extra = self.config.metadata().clone();
        if let Some(o) = options {
            extra.extend(o.metadata().clone());
        }
        extra.extend(aggregated_extra);

        Run {
            id: span.run_id,
            trace_id: span.trace_id,
            name: info.display_name().to_owned(),
            run_type: info.kind,
            start_time: span.start_time,
            end_time: None,
            inputs,
            outputs: None,
            error: None,
            parent_run_id: span.parent_run_id,
            dotted_order: span.dotted_order.clone(),
            session_name,
            tags: tags.into_iter().collect(),
            extra,
            reference_example_id: options
                .and_then(|o| o.reference_example_id())
                .map(str::to_owned),
        }
    }

    async fn create(&self, ctx: &Context, run: &Run) {
        let res = select! {
            biased;
            _ = ctx.cancelled() => Err(SinkError::Cancelled),
            res = self.sink.create_run(ctx, run) => res,
        };
        match res {
            Ok(Some(stored)) if stored.id != run.id => tracing::trace!(
                run_id = %run.id,
                stored_id = %stored.id,
                "Sink stored the run under a different id"
            ),
            Ok(_) => (),
            Err(e) => tracing::warn!(
                err = &e as &dyn std::error::Error,
                run_id = %run.id,
                name = %run.name,
                "Failed to create run"
            ),
        }
    }

    async fn update(&self, ctx: &Context, run_id: RunId, patch: &RunPatch) {
        if let Err(e) = self.sink.update_run(ctx, run_id, patch).await {
            tracing::warn!(
                err = &e as &dyn std::error::Error,
                %run_id,
                "Failed to update run"
            );
        }
    }

    /// Run `fut` on a tracked background task, containing any panic it raises.
    fn spawn_contained<F>(&self, run_id: RunId, task: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(async move {
            if let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await {
                // the hook misses panics when another hook replaced it after ours
                let report = panic::take_report().unwrap_or_else(|| panic::PanicReport {
                    location: None,
                    backtrace: Backtrace::force_capture(),
                });
                tracing::error!(
                    %run_id,
                    task,
                    panic = panic_message(&*payload),
                    location = report.location.as_deref(),
                    backtrace = %report.backtrace,
                    "Background task panicked"
                );
            }
        });
    }
}

/// Give the next run its identity and publish it as the parent for spans below `ctx`.
fn open(ctx: &Context) -> (Context, OpenSpan) {
    let (ctx, state) = get_or_init_state(ctx);
    let run_id = new_run_id();
    let trace_id = state.trace_id.unwrap_or(run_id);
    let start_time = monotonic_now();
    let dotted_order =
        compose_dotted_order(state.parent_dotted_order.as_ref(), start_time, run_id);

    let child = publish_state(
        &ctx,
        TraceState {
            trace_id: Some(trace_id),
            parent_run_id: Some(run_id),
            parent_dotted_order: Some(dotted_order.clone()),
        },
    );
    let span = OpenSpan {
        run_id,
        trace_id,
        parent_run_id: state.parent_run_id,
        start_time,
        dotted_order,
    };
    (child, span)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
