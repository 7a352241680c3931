//! Span linking for run-tree tracing.
//!
//! `runlink` turns nested, possibly concurrent and possibly streaming operations into a tree of
//! runs. Every span gets a fresh [`RunId`] and a [`DottedOrder`] that encodes its ancestry and
//! start order, and the linkage travels through an immutable [`Context`] threaded by the caller,
//! so children find their parent without any shared registry.
//!
//! Runs are delivered to a [`RunSink`]. The crate ships in-process sinks only; plugging in a
//! remote trace store means implementing [`RunSink`] for its client.
//!
//! ```no_run
//! # async fn run() {
//! use runlink::{
//!     context::{set_trace_options, TraceOptions},
//!     Context, LogSink, RunInfo, RunKind, SpanOutcome, Tracer,
//! };
//!
//! let tracer = Tracer::new(LogSink::new());
//! let ctx = set_trace_options(
//!     &Context::new(),
//!     TraceOptions::new().with_session_name("checkout").with_tag("env_test"),
//! );
//!
//! let graph = RunInfo::new("graph", RunKind::Chain);
//! let graph_ctx = tracer.start_span(&ctx, Some(&graph), "hi").await;
//!
//! let node = RunInfo::new("node1", RunKind::Chain);
//! let node_ctx = tracer.start_span(&graph_ctx, Some(&node), "hi").await;
//! tracer.end_span(&node_ctx, Some(&node), SpanOutcome::output(&"hi!")).await;
//!
//! tracer.end_span(&graph_ctx, Some(&graph), SpanOutcome::output(&"hi!")).await;
//! # }
//! ```

pub mod api;
pub mod config;
pub mod context;
pub mod ordering;
pub mod sink;
pub mod tracer;

pub use api::{RunId, RunInfo, RunKind, TokenUsage};
pub use config::TracerConfig;
pub use context::Context;
pub use ordering::DottedOrder;
pub use sink::{BackgroundSink, LogSink, RecordingSink, RunSink, SinkError};
pub use tracer::{SpanOutcome, Tracer};
