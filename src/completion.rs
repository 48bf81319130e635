//! Single-assignment completion slots and the task record that carries them.
use crate::error::RpcQueueError;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

pub type CallResult = Result<Value, RpcQueueError>;

/// Parameters of one call: either positional or keyed, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    Positional(Vec<Value>),
    Keyed(serde_json::Map<String, Value>),
}

impl Params {
    pub fn to_value(&self) -> Value {
        match self {
            Params::Positional(list) => Value::Array(list.clone()),
            Params::Keyed(map) => Value::Object(map.clone()),
        }
    }
}

/// Writing half of a completion slot. Resolving consumes it, so a slot can only ever be
/// resolved once.
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<CallResult>,
}

impl Completion {
    pub fn resolve(self, value: Value) {
        let _ = self.tx.send(Ok(value));
    }

    pub fn fail(self, error: RpcQueueError) {
        let _ = self.tx.send(Err(error));
    }
}

/// Reading half of a completion slot, handed to the caller.
///
/// Awaiting it yields the call result. If the slot's owner is dropped without resolving it
/// the handle fails with [`RpcQueueError::Abandoned`].
#[derive(Debug)]
pub struct CommandHandle {
    rx: oneshot::Receiver<CallResult>,
    done: Option<CallResult>,
}

/// Observable state of a [`CommandHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Pending,
    Resolved,
    Failed,
}

pub fn completion_pair() -> (Completion, CommandHandle) {
    let (tx, rx) = oneshot::channel();
    (Completion { tx }, CommandHandle { rx, done: None })
}

impl CommandHandle {
    /// Peeks at the slot without waiting.
    pub fn state(&mut self) -> HandleState {
        if self.done.is_none() {
            match self.rx.try_recv() {
                Ok(result) => self.done = Some(result),
                Err(oneshot::error::TryRecvError::Empty) => return HandleState::Pending,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.done = Some(Err(RpcQueueError::Abandoned))
                }
            }
        }
        match self.done {
            Some(Ok(_)) => HandleState::Resolved,
            Some(Err(_)) => HandleState::Failed,
            None => HandleState::Pending,
        }
    }
}

impl Future for CommandHandle {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.done.take() {
            return Poll::Ready(result);
        }
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcQueueError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One outstanding remote call.
#[derive(Debug)]
pub struct Task {
    pub method: String,
    pub params: Params,
    pub completion: Completion,
}

impl Task {
    pub fn new(method: impl Into<String>, params: Params) -> (Task, CommandHandle) {
        let (completion, handle) = completion_pair();
        let task = Task {
            method: method.into(),
            params,
            completion,
        };
        (task, handle)
    }
}
