//! Decouple the traced operation from sink latency.
//!
//! [`BackgroundSink`] queues every call on an unbounded channel and returns immediately; a single
//! spawned task replays them in order against the wrapped sink. Call
//! [`BackgroundSinkHandle::finish`] at shutdown to flush whatever is still queued.

use async_trait::async_trait;
use tokio::{
    select,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    sync::oneshot,
    task,
};

use crate::{
    api::{Run, RunId, RunPatch},
    context::Context,
    sink::{RunSink, SinkError},
};

#[derive(Debug)]
enum Message {
    Create(Run),
    Update { run_id: RunId, patch: RunPatch },
}

/// The queueing side. Cheap to clone; every clone feeds the same task.
#[derive(Clone)]
pub struct BackgroundSink {
    sender: UnboundedSender<Message>,
}

/// A handle to control the spawned delivery task.
pub struct BackgroundSinkHandle {
    finish_sender: Option<oneshot::Sender<()>>,
    task: Option<task::JoinHandle<()>>,
}

impl BackgroundSink {
    /// Spawn the delivery task on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime, like [`tokio::spawn`].
    pub fn spawn<S: RunSink + 'static>(inner: S) -> (BackgroundSink, BackgroundSinkHandle) {
        let (sender, recv) = mpsc::unbounded_channel();
        let (finish_sender, finish_receiver) = oneshot::channel();

        let task = tokio::spawn(handler_task(inner, recv, finish_receiver));

        (
            BackgroundSink { sender },
            BackgroundSinkHandle {
                finish_sender: Some(finish_sender),
                task: Some(task),
            },
        )
    }

    fn enqueue(&self, message: Message) -> Result<(), SinkError> {
        self.sender.send(message).map_err(|_| SinkError::Closed)
    }
}

impl BackgroundSinkHandle {
    /// Stop accepting new calls, deliver every queued call, and stop the delivery task.
    ///
    /// Calls made on a [`BackgroundSink`] after this returns fail with [`SinkError::Closed`].
    pub async fn finish(mut self) {
        if let Some(finish) = self.finish_sender.take() {
            let _ = finish.send(());
        }

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(
                    err = &e as &dyn std::error::Error,
                    "Background sink task failed"
                );
            }
        }
    }
}

async fn handler_task<S: RunSink>(
    inner: S,
    mut recv: UnboundedReceiver<Message>,
    mut finish: oneshot::Receiver<()>,
) {
    loop {
        select! {
            message = recv.recv() => match message {
                Some(message) => deliver(&inner, message).await,
                None => return,
            },
            _ = &mut finish => {
                break
            }
        }
    }

    // close channel and drain existing messages
    recv.close();
    while let Some(message) = recv.recv().await {
        deliver(&inner, message).await;
    }
}

async fn deliver<S: RunSink>(inner: &S, message: Message) {
    // the caller's context was consumed at enqueue time
    let ctx = Context::new();
    match message {
        Message::Create(run) => {
            if let Err(e) = inner.create_run(&ctx, &run).await {
                tracing::warn!(
                    err = &e as &dyn std::error::Error,
                    run_id = %run.id,
                    "Failed to deliver run creation"
                );
            }
        }
        Message::Update { run_id, patch } => {
            if let Err(e) = inner.update_run(&ctx, run_id, &patch).await {
                tracing::warn!(
                    err = &e as &dyn std::error::Error,
                    %run_id,
                    "Failed to deliver run update"
                );
            }
        }
    }
}

#[async_trait]
impl RunSink for BackgroundSink {
    async fn create_run(&self, _ctx: &Context, run: &Run) -> Result<Option<Run>, SinkError> {
        self.enqueue(Message::Create(run.clone()))?;
        Ok(None)
    }

    async fn update_run(
        &self,
        _ctx: &Context,
        run_id: RunId,
        patch: &RunPatch,
    ) -> Result<(), SinkError> {
        self.enqueue(Message::Update {
            run_id,
            patch: patch.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::{RunKind, TokenUsage},
        ordering::compose_dotted_order,
        sink::{RecordingSink, SinkCall},
    };
    use std::sync::Arc;

    fn run(name: &str) -> Run {
        let id = RunId::allocate();
        let start_time = chrono::Utc::now();
        Run {
            id,
            trace_id: id,
            name: name.to_owned(),
            run_type: RunKind::Chain,
            start_time,
            end_time: None,
            inputs: Default::default(),
            outputs: None,
            error: None,
            parent_run_id: None,
            dotted_order: compose_dotted_order(None, start_time, id),
            session_name: None,
            tags: Vec::new(),
            extra: Default::default(),
            reference_example_id: None,
        }
    }

    #[tokio::test]
    async fn finish_drains_queued_calls_in_order() {
        let recording = Arc::new(RecordingSink::new());
        let (sink, handle) = BackgroundSink::spawn(recording.clone());
        let ctx = Context::new();

        let runs: Vec<Run> = (0..10).map(|i| run(&format!("node{i}"))).collect();
        for r in &runs {
            assert_eq!(None, sink.create_run(&ctx, r).await.unwrap());
        }
        let patch = RunPatch::ended_at(chrono::Utc::now()).with_usage(TokenUsage::new(1, 1));
        sink.update_run(&ctx, runs[0].id, &patch).await.unwrap();

        handle.finish().await;

        let calls = recording.calls();
        assert_eq!(11, calls.len());
        for (call, r) in calls.iter().zip(&runs) {
            assert_eq!(&SinkCall::Create(r.clone()), call);
        }
        assert_eq!(SinkCall::Update(runs[0].id, patch), calls[10]);

        assert!(matches!(
            sink.create_run(&ctx, &run("late")).await,
            Err(SinkError::Closed)
        ));
    }

    #[tokio::test]
    async fn inner_failures_do_not_stop_delivery() {
        let recording = Arc::new(RecordingSink::new());
        recording.set_fail_creates(true);
        let (sink, handle) = BackgroundSink::spawn(recording.clone());
        let ctx = Context::new();

        sink.create_run(&ctx, &run("a")).await.unwrap();
        sink.create_run(&ctx, &run("b")).await.unwrap();
        handle.finish().await;

        assert_eq!(2, recording.creates().len());
    }
}
