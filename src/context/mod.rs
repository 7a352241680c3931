//! The call context threaded through traced operations.
//!
//! A [`Context`] is an immutable, inheritable carrier of typed values plus an optional
//! cancellation token. Deriving a context with [`Context::with_value`] never touches the
//! original: the new value is pushed onto a shared, reference-counted chain, so siblings derived
//! from the same parent can never observe each other's values, and any number of tasks can read
//! a context concurrently without locking.
//!
//! Values are keyed by their Rust type. The trace options and trace state this crate stores are
//! wrapped in private newtypes, so code outside this module can neither read nor clobber them
//! except through the functions in [`trace`].

use std::{
    any::{Any, TypeId},
    fmt,
    sync::Arc,
};

use tokio_util::sync::CancellationToken;

pub mod options;
pub mod trace;

pub use options::TraceOptions;
pub use trace::{
    current_run_id, get_or_init_state, publish_state, set_trace_options, span_to_string,
    string_to_span, trace_options, trace_state, SpanHandleError, TraceState,
};

struct Node {
    key: TypeId,
    value: Box<dyn Any + Send + Sync>,
    parent: Option<Arc<Node>>,
}

/// See the [module docs](self).
#[derive(Clone, Default)]
pub struct Context {
    values: Option<Arc<Node>>,
    cancel: Option<CancellationToken>,
}

impl Context {
    /// An empty context with no values and no cancellation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a context carrying `value`, shadowing any value of the same type further up.
    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Context {
        Context {
            values: Some(Arc::new(Node {
                key: TypeId::of::<T>(),
                value: Box::new(value),
                parent: self.values.clone(),
            })),
            cancel: self.cancel.clone(),
        }
    }

    /// The nearest value of type `T`, if any.
    pub fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        let key = TypeId::of::<T>();
        let mut node = self.values.as_deref();
        while let Some(n) = node {
            if n.key == key {
                return n.value.downcast_ref::<T>();
            }
            node = n.parent.as_deref();
        }
        None
    }

    /// Derive a context that is cancelled when `token` is.
    pub fn with_cancellation(&self, token: CancellationToken) -> Context {
        Context {
            values: self.values.clone(),
            cancel: Some(token),
        }
    }

    pub fn cancellation_token(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }

    /// Resolves once this context is cancelled; never resolves for a context without a token.
    pub async fn cancelled(&self) {
        match &self.cancel {
            Some(token) => token.cancelled().await,
            None => futures::future::pending::<()>().await,
        }
    }

    /// The same values, without cancellation.
    pub fn detached(&self) -> Context {
        Context {
            values: self.values.clone(),
            cancel: None,
        }
    }

    /// Whether both contexts share the same value chain and cancellation state.
    pub fn ptr_eq(&self, other: &Context) -> bool {
        let same_values = match (&self.values, &other.values) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_values && self.cancel.is_some() == other.cancel.is_some()
    }

    fn depth(&self) -> usize {
        let mut depth = 0;
        let mut node = self.values.as_deref();
        while let Some(n) = node {
            depth += 1;
            node = n.parent.as_deref();
        }
        depth
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("values", &self.depth())
            .field("cancellable", &self.cancel.is_some())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
