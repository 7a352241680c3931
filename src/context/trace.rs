//! Trace options and trace state carried on a [`Context`].

use thiserror::Error;

use crate::{api::RunId, context::Context, context::TraceOptions, ordering::DottedOrder};

/// Where the next span in a call tree attaches.
///
/// Every span publishes a fresh state for its descendants; the state read on span entry is always
/// the one published by the nearest enclosing span.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TraceState {
    /// Shared by every run in the tree; the root run's id unless forced through the options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<RunId>,
    /// The immediately enclosing run, `None` at the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<RunId>,
    /// The immediately enclosing run's dotted order, `None` at the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_dotted_order: Option<DottedOrder>,
}

struct OptionsSlot(TraceOptions);

struct StateSlot(TraceState);

#[derive(Debug, Error)]
pub enum SpanHandleError {
    #[error("Failed to encode trace state")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode span handle")]
    Decode(#[source] serde_json::Error),
}

/// Derive a context carrying `options`. The original context is left untouched.
pub fn set_trace_options(ctx: &Context, options: TraceOptions) -> Context {
    ctx.with_value(OptionsSlot(options))
}

pub fn trace_options(ctx: &Context) -> Option<&TraceOptions> {
    ctx.value::<OptionsSlot>().map(|slot| &slot.0)
}

pub fn trace_state(ctx: &Context) -> Option<&TraceState> {
    ctx.value::<StateSlot>().map(|slot| &slot.0)
}

/// Derive a context carrying `state` for the spans below it.
pub fn publish_state(ctx: &Context, state: TraceState) -> Context {
    ctx.with_value(StateSlot(state))
}

/// The trace state of `ctx`, initializing one from the trace options when there is none yet.
///
/// A context that already carries state is returned as is. Otherwise the state is seeded from the
/// options' trace id, parent run and parent dotted order (all empty unless the options resume an
/// existing trace) and published on a derived context.
pub fn get_or_init_state(ctx: &Context) -> (Context, TraceState) {
    if let Some(state) = trace_state(ctx) {
        return (ctx.clone(), state.clone());
    }

    let state = trace_options(ctx)
        .map(TraceOptions::initial_state)
        .unwrap_or_default();
    (publish_state(ctx, state.clone()), state)
}

/// The run id of the nearest enclosing span.
pub fn current_run_id(ctx: &Context) -> Option<RunId> {
    trace_state(ctx).and_then(|state| state.parent_run_id)
}

/// Serialize the trace state of `ctx` so the trace can be continued elsewhere, e.g. in another
/// process. A context without trace state serializes to the empty string.
pub fn span_to_string(ctx: &Context) -> Result<String, SpanHandleError> {
    match trace_state(ctx) {
        Some(state) => serde_json::to_string(state).map_err(SpanHandleError::Encode),
        None => Ok(String::new()),
    }
}

/// Parse a handle produced by [`span_to_string`]. The empty string yields no state.
///
/// Resume the trace with [`TraceOptions::resume_from`].
pub fn string_to_span(handle: &str) -> Result<Option<TraceState>, SpanHandleError> {
    if handle.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(handle)
        .map(Some)
        .map_err(SpanHandleError::Decode)
}
