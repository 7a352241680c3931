// A two-node graph plus a streaming model call, traced to the log.
//
// Run with `RUST_LOG=runlink=info cargo run --example graph --features init_tracing`.
// Defaults can be set with RUNLINK_SESSION_NAME, RUNLINK_TAGS and RUNLINK_METADATA.

use runlink::{
    context::{set_trace_options, span_to_string, string_to_span, TraceOptions},
    sink::BackgroundSink,
    tracer::{MessageAggregator, MessageChunk},
    Context, LogSink, RunInfo, RunKind, SpanOutcome, TokenUsage, Tracer, TracerConfig,
};

async fn node(tracer: &Tracer, ctx: &Context, name: &str, input: &str) -> String {
    let info = RunInfo::new(name, RunKind::Chain).with_component("Lambda");
    let ctx = tracer.start_span(ctx, Some(&info), input).await;
    let output = format!("{input}!");
    tracer
        .end_span(&ctx, Some(&info), SpanOutcome::output(&output))
        .await;
    output
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    runlink::init_tracing!();
    let cfg = TracerConfig::from_env()?;
    let (sink, sink_handle) = BackgroundSink::spawn(LogSink::new());
    let tracer = Tracer::with_config(sink, cfg);

    let ctx = set_trace_options(
        &Context::new(),
        TraceOptions::new()
            .with_session_name("demo")
            .with_tag("cid_test")
            .with_tag("env_test")
            .with_metadata("cid", "cid_test")
            .with_metadata("env", "env_test"),
    );

    let (ctx, flow_id) = tracer.start_named_span(&ctx, "flow", RunKind::Chain).await;

    let graph = RunInfo::new("graph", RunKind::Chain);
    let graph_ctx = tracer.start_span(&ctx, Some(&graph), "some input").await;
    let out = node(&tracer, &graph_ctx, "node1", "some input").await;
    let out = node(&tracer, &graph_ctx, "node2", &out).await;

    let model = RunInfo::new("", RunKind::Llm).with_component("ChatModel");
    let model_ctx = tracer.start_span(&graph_ctx, Some(&model), &out).await;
    let chunks = vec![
        Ok::<_, std::io::Error>(MessageChunk::content("test ").with_role("assistant")),
        Ok(MessageChunk::content("output")
            .with_model("demo-model")
            .with_usage(TokenUsage::new(12, 2))),
    ];
    tracer.end_span_with_stream_output(
        &model_ctx,
        Some(&model),
        futures::stream::iter(chunks),
        MessageAggregator,
    );

    tracer
        .end_span(&graph_ctx, Some(&graph), SpanOutcome::output(&out))
        .await;

    // continue the trace as if in another process
    let handle = span_to_string(&ctx)?;
    tracing::info!(%handle, "Handing off trace");
    if let Some(state) = string_to_span(&handle)? {
        let remote = set_trace_options(&Context::new(), TraceOptions::resume_from(&state));
        node(&tracer, &remote, "remote", "handoff").await;
    }

    if let Some(flow_id) = flow_id {
        tracer.finish_span(&ctx, flow_id).await;
    }

    tracer.flush().await;
    sink_handle.finish().await;
    Ok(())
}
