//! Scripted collaborators shared by the unit tests.
use crate::error::TransportError;
use crate::injector::{HostInjector, HostSink, SubscriptionId};
use crate::transport::{HttpReply, Transport};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Mutex, Weak};
use std::time::Duration;

type Handler = dyn Fn(usize, &str, &[Value]) -> Result<HttpReply, TransportError> + Send + Sync;
type Latency = dyn Fn(&str) -> Duration + Send + Sync;

/// Transport answering every post with whatever `handler` makes of it. The handler gets the
/// call number, the target URL and the decoded request batch.
pub(crate) struct ScriptedTransport {
    handler: Box<Handler>,
    latency: Option<Box<Latency>>,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport").finish()
    }
}

impl ScriptedTransport {
    pub(crate) fn new<F>(handler: F) -> Self
    where
        F: Fn(usize, &str, &[Value]) -> Result<HttpReply, TransportError> + Send + Sync + 'static,
    {
        ScriptedTransport {
            handler: Box::new(handler),
            latency: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_latency<L>(mut self, latency: L) -> Self
    where
        L: Fn(&str) -> Duration + Send + Sync + 'static,
    {
        self.latency = Some(Box::new(latency));
        self
    }

    pub(crate) fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpReply, TransportError> {
        let requests: Vec<Value> = serde_json::from_slice(&body).expect("forwarder sends arrays");
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((url.to_string(), requests.clone()));
            calls.len() - 1
        };
        if let Some(latency) = &self.latency {
            tokio::time::sleep(latency(url)).await;
        }
        (self.handler)(index, url, &requests)
    }
}

pub(crate) fn json_reply(status: u16, body: Value) -> HttpReply {
    HttpReply {
        status,
        body: serde_json::to_vec(&body).unwrap(),
    }
}

pub(crate) fn text_reply(status: u16, body: &str) -> HttpReply {
    HttpReply {
        status,
        body: body.as_bytes().to_vec(),
    }
}

/// Answers every request with its own params as the result.
pub(crate) fn echo_reply(requests: &[Value]) -> HttpReply {
    let entries: Vec<Value> = requests
        .iter()
        .map(|r| json!({"id": r["id"], "jsonrpc": "2.0", "result": r["params"]}))
        .collect();
    json_reply(200, Value::Array(entries))
}

/// Injector driven by hand from the test body.
#[derive(Default)]
pub(crate) struct ManualInjector {
    sinks: Mutex<Vec<(SubscriptionId, Weak<dyn HostSink>)>>,
}

impl std::fmt::Debug for ManualInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualInjector").finish()
    }
}

impl ManualInjector {
    pub(crate) fn push(&self, url: &str) {
        let sinks: Vec<_> = self.sinks.lock().unwrap().iter().map(|(_, s)| s.clone()).collect();
        for sink in sinks.iter().filter_map(Weak::upgrade) {
            sink.inject_host_url(url);
        }
    }

    pub(crate) fn subscribers(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }
}

impl HostInjector for ManualInjector {
    fn subscribe(&self, sink: Weak<dyn HostSink>) -> SubscriptionId {
        let mut sinks = self.sinks.lock().unwrap();
        let id = sinks.len() as SubscriptionId + 1;
        sinks.push((id, sink));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.sinks.lock().unwrap().retain(|(sid, _)| *sid != id);
    }
}
