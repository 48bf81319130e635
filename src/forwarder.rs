//! # Batch forwarder
//!
//! Drains an [`RpcQueue`] one batch at a time, ships each batch as a single JSON-RPC 2.0
//! batch request and routes every response element back to the task that asked for it.
//!
//! ## Lifecycle
//! ```text
//! Uninitialized --(first host)--> Idle --> AwaitingBatch --> Sending --> ProcessingResponse
//!                                               ^                               |
//!                                               +-------------------------------+
//! ```
//! There is never more than one batch in flight per forwarder. The next batch is only asked
//! for once every task of the previous one has been resolved, or put back in the queue.
//!
//! ## Failures
//! - Transport failures and unusable bodies fail every task in the batch with the same error.
//! - Per-entry errors only fail their own task.
//! - HTTP 413 with a batch ceiling above one drops the ceiling to one and puts the batch back
//!   at the front of the queue instead of failing it.
//!
//! No retries happen here beyond the 413 case; callers decide what to do with failures.
use crate::completion::Task;
use crate::error::RpcQueueError;
use crate::injector::{HostInjector, HostSink, SubscriptionId};
use crate::rpc::{self, EntryOutcome, RpcRequest, PADDING_METHOD};
use crate::scheduler::Scheduler;
use crate::transport::{HttpReply, Transport};
use crate::translator::RpcQueue;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub const DEFAULT_MAXBATCH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    /// Waiting for a host injector to provide the first URL.
    Uninitialized,
    Idle,
    AwaitingBatch,
    Sending,
    ProcessingResponse,
    Stopped,
}

/// Where a forwarder sends its batches.
#[derive(Debug, Clone)]
pub enum HostSource {
    Static(String),
    Injector(Arc<dyn HostInjector>),
}

#[derive(Debug, Clone)]
pub struct ForwarderOptions {
    /// Upper bound on the number of tasks per batch.
    pub maxbatch: usize,
    /// Pad single-command batches with a throwaway command.
    pub pad_singletons: bool,
}

impl Default for ForwarderOptions {
    fn default() -> Self {
        ForwarderOptions {
            maxbatch: DEFAULT_MAXBATCH,
            pad_singletons: false,
        }
    }
}

struct Shared {
    host: watch::Sender<Option<String>>,
    state: Mutex<ForwarderState>,
    maxbatch: AtomicUsize,
}

impl Shared {
    fn set_state(&self, state: ForwarderState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    fn state(&self) -> ForwarderState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Moves out of `Uninitialized`, leaving any later state alone.
    fn mark_initialized(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state == ForwarderState::Uninitialized {
            *state = ForwarderState::Idle;
        }
    }
}

impl HostSink for Shared {
    fn inject_host_url(&self, url: &str) {
        let previous = self.host.send_replace(Some(url.to_string()));
        if previous.as_deref() != Some(url) {
            tracing::info!(url, previous = ?previous, "Forwarder target host updated");
        }
        self.mark_initialized();
    }
}

/// Handle on a running forwarder loop. Dropping it stops the loop once any in-flight batch
/// has been dealt with, and unsubscribes from the host injector.
pub struct BatchForwarder {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    subscription: Option<(Arc<dyn HostInjector>, SubscriptionId)>,
}

impl std::fmt::Debug for BatchForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchForwarder")
            .field("host", &self.host())
            .field("state", &self.state())
            .field("maxbatch", &self.maxbatch())
            .finish()
    }
}

impl BatchForwarder {
    pub fn spawn(
        queue: RpcQueue,
        host: HostSource,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        options: ForwarderOptions,
    ) -> Self {
        let (initial_host, initial_state) = match &host {
            HostSource::Static(url) => (Some(url.clone()), ForwarderState::Idle),
            HostSource::Injector(_) => (None, ForwarderState::Uninitialized),
        };

        let shared = Arc::new(Shared {
            host: watch::Sender::new(initial_host),
            state: Mutex::new(initial_state),
            maxbatch: AtomicUsize::new(options.maxbatch.max(1)),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);

        // Subscribe before the loop starts so an injector with a known best host can hand it
        // over right away.
        let subscription = match host {
            HostSource::Injector(injector) => {
                let sink: Arc<dyn HostSink> = shared.clone();
                let id = injector.subscribe(Arc::downgrade(&sink));
                Some((injector, id))
            }
            HostSource::Static(_) => None,
        };

        let worker = Worker {
            shared: shared.clone(),
            queue,
            transport,
            pad_singletons: options.pad_singletons,
            next_id: 0,
        };
        scheduler.spawn(Box::pin(worker.run(shutdown_rx)));

        BatchForwarder {
            shared,
            shutdown,
            subscription,
        }
    }

    /// Points the next send at `url`. Does not affect a batch already in flight.
    pub fn inject_host_url(&self, url: &str) {
        self.shared.inject_host_url(url);
    }

    pub fn host(&self) -> Option<String> {
        self.shared.host.borrow().clone()
    }

    pub fn state(&self) -> ForwarderState {
        self.shared.state()
    }

    pub fn maxbatch(&self) -> usize {
        self.shared.maxbatch.load(Ordering::Relaxed)
    }
}

impl Drop for BatchForwarder {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        if let Some((injector, id)) = self.subscription.take() {
            injector.unsubscribe(id);
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    queue: RpcQueue,
    transport: Arc<dyn Transport>,
    pad_singletons: bool,
    next_id: u64,
}

impl Worker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut host_rx = self.shared.host.subscribe();
        let ready = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => false,
            ready = host_ready(&mut host_rx) => ready,
        };

        if ready {
            loop {
                self.shared.set_state(ForwarderState::AwaitingBatch);
                let maxbatch = self.shared.maxbatch.load(Ordering::Relaxed);
                let mut incoming = self.queue.next_batch(maxbatch);
                let batch = tokio::select! {
                    biased;
                    _ = stopped(&mut shutdown) => {
                        // A batch may already sit in the channel; it goes back to the queue.
                        incoming.close();
                        if let Ok(batch) = incoming.try_recv() {
                            self.queue.requeue(batch);
                        }
                        break;
                    }
                    batch = &mut incoming => match batch {
                        Ok(batch) => batch,
                        Err(_) => break,
                    },
                };

                let Some(url) = self.shared.host.borrow().clone() else {
                    self.queue.requeue(batch);
                    break;
                };
                self.process_batch(&url, batch).await;
            }
        }

        self.shared.set_state(ForwarderState::Stopped);
        tracing::debug!("Forwarder loop stopped");
    }

    async fn process_batch(&mut self, url: &str, batch: Vec<Task>) {
        self.shared.set_state(ForwarderState::Sending);

        let mut pending: BTreeMap<u64, Task> = BTreeMap::new();
        let mut envelope = Vec::with_capacity(batch.len() + 1);
        for task in batch {
            let id = self.fresh_id();
            envelope.push(RpcRequest::new(id, task.method.clone(), task.params.to_value()));
            pending.insert(id, task);
        }
        if self.pad_singletons && envelope.len() == 1 {
            let id = self.fresh_id();
            envelope.push(RpcRequest::new(id, PADDING_METHOD, serde_json::json!([])));
        }

        let body = match serde_json::to_vec(&envelope) {
            Ok(body) => body,
            Err(e) => {
                fail_all(
                    pending,
                    RpcQueueError::Protocol {
                        url: url.to_string(),
                        status: 0,
                        message: format!("could not encode batch: {}", e),
                    },
                );
                return;
            }
        };

        tracing::debug!(url, size = envelope.len(), "Sending JSON-RPC batch");
        let reply = self.transport.post(url, body).await;
        self.shared.set_state(ForwarderState::ProcessingResponse);

        match reply {
            Ok(reply) => self.handle_reply(url, reply, pending),
            Err(e) => {
                tracing::warn!(url, kind = ?e.kind, error = %e.message, tasks = pending.len(), "Batch failed in transport");
                fail_all(pending, RpcQueueError::Transport(e));
            }
        }
    }

    fn handle_reply(&self, url: &str, reply: HttpReply, pending: BTreeMap<u64, Task>) {
        let parsed = serde_json::from_slice::<serde_json::Value>(&reply.body);
        let message = match parsed {
            Ok(serde_json::Value::Array(entries)) => {
                correlate(url, entries, pending);
                return;
            }
            Ok(_) => format!("non-batch JSON response from server {}: {}", url, reply.body_text()),
            Err(e) => format!("unparseable response from server {}: {}", url, e),
        };

        let status = reply.status;
        let maxbatch = self.shared.maxbatch.load(Ordering::Relaxed);
        if status == 413 && maxbatch > 1 {
            tracing::info!(url, previous = maxbatch, tasks = pending.len(), "Payload too large, shrinking batch size to 1");
            self.shared.maxbatch.store(1, Ordering::Relaxed);
            self.queue.requeue(pending.into_values().collect());
            return;
        }

        let error = match status {
            500..=599 => RpcQueueError::HttpServer {
                status,
                body: reply.body_text(),
            },
            400..=499 => RpcQueueError::HttpClient {
                status,
                body: reply.body_text(),
            },
            _ => RpcQueueError::Protocol {
                url: url.to_string(),
                status,
                message,
            },
        };
        tracing::warn!(url, status, error = %error, tasks = pending.len(), "Batch failed");
        fail_all(pending, error);
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender means the handle is gone, which is a stop as well.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn host_ready(host: &mut watch::Receiver<Option<String>>) -> bool {
    host.wait_for(Option::is_some).await.is_ok()
}

fn correlate(url: &str, entries: Vec<serde_json::Value>, mut pending: BTreeMap<u64, Task>) {
    for entry in entries {
        let Some(task) = rpc::entry_id(&entry).and_then(|id| pending.remove(&id)) else {
            continue;
        };
        match rpc::entry_outcome(&entry) {
            EntryOutcome::Result(value) => task.completion.resolve(value),
            EntryOutcome::Error(error) => task.completion.fail(RpcQueueError::Command {
                code: error.code,
                message: error.message,
                data: error.data,
            }),
            EntryOutcome::Malformed => task.completion.fail(RpcQueueError::CommandResponse {
                message: format!(
                    "neither result nor valid error field in response from server {}",
                    url
                ),
                entry: Some(entry),
            }),
        }
    }

    if !pending.is_empty() {
        tracing::warn!(url, missing = pending.len(), "Batch response is missing command ids");
    }
    for task in pending.into_values() {
        task.completion.fail(RpcQueueError::CommandResponse {
            message: format!(
                "bad JSON-RPC response from server {}, request command id not found in response",
                url
            ),
            entry: None,
        });
    }
}

fn fail_all(pending: BTreeMap<u64, Task>, error: RpcQueueError) {
    for task in pending.into_values() {
        task.completion.fail(error.clone());
    }
}
