//! In-memory [`WorkDispatcher`]/[`ActionSink`] for tests and examples
//!
//! Not wired to any real queue or journal: work is handed to it directly via
//! [`InMemoryWorkQueue::push`], and reported outcomes are simply appended to
//! an in-memory log for the test to assert against.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::action::Action;
use crate::activity::ActivityOutcome;
use crate::dispatch::{ActionSink, DispatchError, WorkDispatcher, WorkItem};

/// A FIFO queue of [`WorkItem`]s plus a log of reported results, usable as
/// both ends of the dispatch/sink pair in tests
#[derive(Default)]
pub struct InMemoryWorkQueue {
    pending: Mutex<Vec<WorkItem>>,
    turn_results: Mutex<Vec<(String, Vec<Action>)>>,
    activity_results: Mutex<Vec<(String, u64, ActivityOutcome)>>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: WorkItem) {
        self.pending.lock().unwrap().push(item);
    }

    pub fn turn_results(&self) -> Vec<(String, Vec<Action>)> {
        self.turn_results.lock().unwrap().clone()
    }

    pub fn activity_results(&self) -> Vec<(String, u64, ActivityOutcome)> {
        self.activity_results.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkDispatcher for InMemoryWorkQueue {
    async fn poll(&self, max_items: usize) -> Result<Vec<WorkItem>, DispatchError> {
        let mut pending = self.pending.lock().unwrap();
        let take = max_items.min(pending.len());
        Ok(pending.drain(..take).collect())
    }
}

#[async_trait]
impl ActionSink for InMemoryWorkQueue {
    async fn record_turn_actions(
        &self,
        instance_id: &str,
        actions: Vec<Action>,
    ) -> Result<(), DispatchError> {
        self.turn_results
            .lock()
            .unwrap()
            .push((instance_id.to_string(), actions));
        Ok(())
    }

    async fn record_activity_outcome(
        &self,
        instance_id: &str,
        task_event_id: u64,
        outcome: ActivityOutcome,
    ) -> Result<(), DispatchError> {
        self.activity_results
            .lock()
            .unwrap()
            .push((instance_id.to_string(), task_event_id, outcome));
        Ok(())
    }
}
