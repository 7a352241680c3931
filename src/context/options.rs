use std::collections::BTreeSet;

use serde_json::Value;

use crate::{
    api::{JsonMap, RunId},
    context::TraceState,
    ordering::DottedOrder,
};

/// Trace-level options, set once on a [`Context`](crate::Context) with
/// [`set_trace_options`](crate::context::set_trace_options) and inherited by every span below it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TraceOptions {
    pub(crate) session_name: Option<String>,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) metadata: JsonMap,
    pub(crate) trace_id: Option<RunId>,
    pub(crate) reference_example_id: Option<String>,
    pub(crate) parent_run_id: Option<RunId>,
    pub(crate) parent_dotted_order: Option<DottedOrder>,
}

impl TraceOptions {
    pub fn new() -> TraceOptions {
        Self::default()
    }

    /// Options that continue a trace from a previously serialized
    /// [span handle](crate::context::string_to_span): the next span started below them becomes a
    /// child of the run the state points at.
    pub fn resume_from(state: &TraceState) -> TraceOptions {
        TraceOptions::new().with_resume(state)
    }

    /// Set the session (project) name runs are filed under.
    pub fn set_session_name<S: Into<String>>(&mut self, name: S) {
        self.session_name = Some(name.into());
    }
    /// A chainable version of [set_session_name](Self::set_session_name).
    pub fn with_session_name<S: Into<String>>(mut self, name: S) -> Self {
        self.set_session_name(name);
        self
    }

    /// Add a tag to every run in the trace.
    ///
    /// This can be called multiple times.
    pub fn add_tag<S: Into<String>>(&mut self, tag: S) {
        self.tags.insert(tag.into());
    }
    /// A chainable version of [add_tag](Self::add_tag).
    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.add_tag(tag);
        self
    }

    /// Add arbitrary metadata to every run in the trace.
    ///
    /// This can be called multiple times; a repeated key replaces the earlier value.
    pub fn add_metadata<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) {
        self.metadata.insert(key.into(), value.into());
    }
    /// A chainable version of [add_metadata](Self::add_metadata).
    pub fn with_metadata<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.add_metadata(key, value);
        self
    }

    /// Replace all metadata at once.
    pub fn set_metadata_map(&mut self, metadata: JsonMap) {
        self.metadata = metadata;
    }
    /// A chainable version of [set_metadata_map](Self::set_metadata_map).
    pub fn with_metadata_map(mut self, metadata: JsonMap) -> Self {
        self.set_metadata_map(metadata);
        self
    }

    /// Force the trace id instead of using the root run's id.
    pub fn set_trace_id(&mut self, id: RunId) {
        self.trace_id = Some(id);
    }
    /// A chainable version of [set_trace_id](Self::set_trace_id).
    pub fn with_trace_id(mut self, id: RunId) -> Self {
        self.set_trace_id(id);
        self
    }

    /// Associate runs with a dataset example.
    pub fn set_reference_example_id<S: Into<String>>(&mut self, id: S) {
        self.reference_example_id = Some(id.into());
    }
    /// A chainable version of [set_reference_example_id](Self::set_reference_example_id).
    pub fn with_reference_example_id<S: Into<String>>(mut self, id: S) -> Self {
        self.set_reference_example_id(id);
        self
    }

    /// Seed the trace id, parent run and parent dotted order from an existing trace state.
    pub fn set_resume(&mut self, state: &TraceState) {
        self.trace_id = state.trace_id;
        self.parent_run_id = state.parent_run_id;
        self.parent_dotted_order = state.parent_dotted_order.clone();
    }
    /// A chainable version of [set_resume](Self::set_resume).
    pub fn with_resume(mut self, state: &TraceState) -> Self {
        self.set_resume(state);
        self
    }

    pub fn session_name(&self) -> Option<&str> {
        self.session_name.as_deref()
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn metadata(&self) -> &JsonMap {
        &self.metadata
    }

    pub fn trace_id(&self) -> Option<RunId> {
        self.trace_id
    }

    pub fn reference_example_id(&self) -> Option<&str> {
        self.reference_example_id.as_deref()
    }

    /// The state a trace starts from when no span has run yet below these options.
    pub(crate) fn initial_state(&self) -> TraceState {
        TraceState {
            trace_id: self.trace_id,
            parent_run_id: self.parent_run_id,
            parent_dotted_order: self.parent_dotted_order.clone(),
        }
    }
}
