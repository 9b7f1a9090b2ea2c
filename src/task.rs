//! A single pending call and the caller waiting on it.

use rmpv::Value;
use tokio::{sync::oneshot, task::AbortHandle};

use crate::{errors::PoolError, messages::Request, sequence::TASK_SERIAL};

pub(crate) type TaskReply = oneshot::Sender<Result<Value, PoolError>>;

#[derive(Debug)]
pub(crate) struct Task {
    pub(crate) id: u64,
    pub(crate) method: String,
    pub(crate) args: Vec<Value>,
    pub(crate) retries: u32,
    reply: TaskReply,
    timer: Option<AbortHandle>,
}

impl Task {
    pub(crate) fn new(method: String, args: Vec<Value>, reply: TaskReply) -> Self {
        Self {
            id: TASK_SERIAL.next_value(),
            method,
            args,
            retries: 0,
            reply,
            timer: None,
        }
    }

    pub(crate) fn request(&self, worker_id: u64) -> Request {
        Request {
            call_id: self.id,
            worker_id,
            method: self.method.clone(),
            args: self.args.clone(),
        }
    }

    pub(crate) fn has_reached_retry_limit(&self, max_retries: u32) -> bool {
        self.retries >= max_retries
    }

    pub(crate) fn increment_retries(&mut self) {
        self.retries = self.retries.saturating_add(1);
    }

    pub(crate) fn set_timer(&mut self, timer: AbortHandle) {
        if let Some(previous) = self.timer.replace(timer) {
            previous.abort();
        }
    }

    pub(crate) fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn resolve(self, value: Value) {
        self.settle(Ok(value));
    }

    pub(crate) fn reject(self, error: PoolError) {
        self.settle(Err(error));
    }

    /// Deliver the outcome. Callers that stopped waiting are ignored.
    fn settle(mut self, outcome: Result<Value, PoolError>) {
        self.clear_timer();
        let _ = self.reply.send(outcome);
    }
}
