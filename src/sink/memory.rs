//! An in-memory sink that records every call it receives.
//!
//! Useful for embedding a trace in-process and for asserting on what a tracer produced.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    api::{Run, RunId, RunPatch},
    context::Context,
    sink::{RunSink, SinkError},
};

/// One recorded sink call.
#[derive(Clone, Debug, PartialEq)]
pub enum SinkCall {
    Create(Run),
    Update(RunId, RunPatch),
}

#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    changed: Notify,
    fail_creates: AtomicBool,
    fail_updates: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `create_run` fail after being recorded.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `update_run` fail after being recorded.
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Every call, in arrival order.
    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().clone()
    }

    pub fn creates(&self) -> Vec<Run> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                SinkCall::Create(run) => Some(run.clone()),
                SinkCall::Update(..) => None,
            })
            .collect()
    }

    pub fn updates(&self) -> Vec<(RunId, RunPatch)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                SinkCall::Update(id, patch) => Some((*id, patch.clone())),
                SinkCall::Create(_) => None,
            })
            .collect()
    }

    /// The created run named `name`, if exactly one exists.
    pub fn created(&self, name: &str) -> Option<Run> {
        let mut matching = self.creates().into_iter().filter(|run| run.name == name);
        let run = matching.next()?;
        matching.next().is_none().then_some(run)
    }

    /// Wait until at least `creates` creations and `updates` updates have been recorded.
    pub async fn wait_for(&self, creates: usize, updates: usize) {
        loop {
            let notified = self.changed.notified();
            {
                let calls = self.calls.lock();
                let seen_creates = calls
                    .iter()
                    .filter(|c| matches!(c, SinkCall::Create(_)))
                    .count();
                if seen_creates >= creates && calls.len() - seen_creates >= updates {
                    return;
                }
            }
            notified.await;
        }
    }

    fn record(&self, call: SinkCall) {
        self.calls.lock().push(call);
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl RunSink for RecordingSink {
    async fn create_run(&self, _ctx: &Context, run: &Run) -> Result<Option<Run>, SinkError> {
        self.record(SinkCall::Create(run.clone()));
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(SinkError::UnexpectedFailure(anyhow!(
                "injected create failure for run {}",
                run.id
            )));
        }
        Ok(Some(run.clone()))
    }

    async fn update_run(
        &self,
        _ctx: &Context,
        run_id: RunId,
        patch: &RunPatch,
    ) -> Result<(), SinkError> {
        self.record(SinkCall::Update(run_id, patch.clone()));
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(SinkError::UnexpectedFailure(anyhow!(
                "injected update failure for run {run_id}"
            )));
        }
        Ok(())
    }
}
