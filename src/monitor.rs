//! # Node health monitoring
//!
//! One [`NodeMonitor`] per known node URL. Every tick it looks up the `fullnodeupdate`
//! account through its own small queue and forwarder, times the round trip, reports the
//! latency to [`FastestNode`] and registers any node URLs advertised in the account's
//! metadata with the [`MonitorSet`].
//!
//! | probe outcome                | next tick after |
//! |------------------------------|-----------------|
//! | success                      | 60 s            |
//! | HTTP client error (4xx)      | 6 h             |
//! | anything else                | 30 min          |
//!
//! [`HealthInjector`] ties a monitor set and a selector together and is what forwarders
//! subscribe to.
use crate::error::ConfigError;
use crate::forwarder::{BatchForwarder, ForwarderOptions, HostSource};
use crate::injector::{HostInjector, HostSink, SubscriptionId};
use crate::queue::HysteresisQueue;
use crate::scheduler::Scheduler;
use crate::selector::{FastestNode, DEFAULT_RESCAN_GRACE};
use crate::translator::{CondenserApi, RpcQueue};
use crate::transport::Transport;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;

pub const PROBE_ACCOUNT: &str = "fullnodeupdate";

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub probe_account: String,
    pub queue_low: usize,
    pub queue_high: usize,
    pub ok_interval: Duration,
    pub permanent_failure_interval: Duration,
    pub temporary_failure_interval: Duration,
    pub rescan_grace: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings {
            probe_account: PROBE_ACCOUNT.to_string(),
            queue_low: 80,
            queue_high: 100,
            ok_interval: Duration::from_secs(60),
            permanent_failure_interval: Duration::from_secs(6 * 60 * 60),
            temporary_failure_interval: Duration::from_secs(30 * 60),
            rescan_grace: DEFAULT_RESCAN_GRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy(Duration),
    PermanentFailure,
    TemporaryFailure,
}

impl ProbeOutcome {
    fn next_tick(&self, settings: &MonitorSettings) -> Duration {
        match self {
            ProbeOutcome::Healthy(_) => settings.ok_interval,
            ProbeOutcome::PermanentFailure => settings.permanent_failure_interval,
            ProbeOutcome::TemporaryFailure => settings.temporary_failure_interval,
        }
    }
}

/// Every monitored node, keyed by URL. Monitors are created once and live as long as the set.
pub struct MonitorSet {
    fastest: Arc<FastestNode>,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    settings: Arc<MonitorSettings>,
    monitors: Mutex<HashMap<String, Arc<NodeMonitor>>>,
    me: Weak<MonitorSet>,
}

impl std::fmt::Debug for MonitorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorSet")
            .field("nodes", &self.urls())
            .field("settings", &self.settings)
            .finish()
    }
}

impl MonitorSet {
    pub fn new(
        fastest: Arc<FastestNode>,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        settings: MonitorSettings,
    ) -> Result<Arc<Self>, ConfigError> {
        if settings.queue_high == 0 || settings.queue_low > settings.queue_high {
            return Err(ConfigError::Invalid(format!(
                "monitor queue watermarks must satisfy low <= high and high > 0 (low={}, high={})",
                settings.queue_low, settings.queue_high
            )));
        }
        Ok(Arc::new_cyclic(|me| MonitorSet {
            fastest,
            transport,
            scheduler,
            settings: Arc::new(settings),
            monitors: Mutex::new(HashMap::new()),
            me: me.clone(),
        }))
    }

    /// Starts monitoring `url` unless it is monitored already. Returns whether a new monitor
    /// was created.
    pub fn process_node_url(&self, url: &str) -> bool {
        let monitor = {
            let mut monitors = self.monitors.lock().unwrap_or_else(|p| p.into_inner());
            if monitors.contains_key(url) {
                return false;
            }
            let monitor = match NodeMonitor::new(url, self) {
                Ok(monitor) => Arc::new(monitor),
                Err(e) => {
                    tracing::error!(url, error = %e, "Could not start node monitor");
                    return false;
                }
            };
            monitors.insert(url.to_string(), monitor.clone());
            monitor
        };

        tracing::info!(url, "Monitoring new node");
        monitor.tick();
        true
    }

    pub fn len(&self) -> usize {
        self.monitors.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, url: &str) -> bool {
        self.monitors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(url)
    }

    pub fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .monitors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        urls.sort();
        urls
    }

    /// Outcome of the last finished probe of `url`, if any.
    pub fn last_outcome(&self, url: &str) -> Option<ProbeOutcome> {
        let monitor = self
            .monitors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(url)
            .cloned()?;
        monitor.last_outcome()
    }
}

pub struct NodeMonitor {
    url: String,
    queue: RpcQueue,
    // Held for its lifetime; dropping it stops the forwarder loop.
    _forwarder: BatchForwarder,
    fastest: Arc<FastestNode>,
    scheduler: Arc<dyn Scheduler>,
    settings: Arc<MonitorSettings>,
    set: Weak<MonitorSet>,
    last: Mutex<Option<ProbeOutcome>>,
}

impl NodeMonitor {
    fn new(url: &str, set: &MonitorSet) -> Result<Self, ConfigError> {
        let settings = set.settings.clone();
        let queue = HysteresisQueue::new(settings.queue_low, settings.queue_high, set.scheduler.clone())?;
        let queue = RpcQueue::new(queue, Some(CondenserApi::NAMESPACE.to_string()));
        let forwarder = BatchForwarder::spawn(
            queue.clone(),
            HostSource::Static(url.to_string()),
            set.transport.clone(),
            set.scheduler.clone(),
            ForwarderOptions::default(),
        );

        Ok(NodeMonitor {
            url: url.to_string(),
            queue,
            _forwarder: forwarder,
            fastest: set.fastest.clone(),
            scheduler: set.scheduler.clone(),
            settings,
            set: set.me.clone(),
            last: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn last_outcome(&self) -> Option<ProbeOutcome> {
        *self.last.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn tick(self: &Arc<Self>) {
        let monitor = self.clone();
        self.scheduler.spawn(Box::pin(async move { monitor.probe().await }));
    }

    async fn probe(self: Arc<Self>) {
        let started = Instant::now();
        let handle = self
            .queue
            .condenser_api()
            .get_accounts(&[self.settings.probe_account.as_str()]);
        let result = handle.await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(accounts) => {
                let discovered = harvest_node_urls(&accounts);
                tracing::debug!(url = %self.url, elapsed_ms = elapsed.as_millis() as u64, advertised = discovered.len(), "Node probe succeeded");
                if let Some(set) = self.set.upgrade() {
                    for node in &discovered {
                        set.process_node_url(node);
                    }
                }
                ProbeOutcome::Healthy(elapsed)
            }
            Err(e) if e.is_permanent() => {
                tracing::warn!(url = %self.url, error = %e, "Node probe failed permanently");
                ProbeOutcome::PermanentFailure
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "Node probe failed");
                ProbeOutcome::TemporaryFailure
            }
        };

        *self.last.lock().unwrap_or_else(|p| p.into_inner()) = Some(outcome);
        if let ProbeOutcome::Healthy(speed) = outcome {
            self.fastest.set_node_speed(&self.url, speed);
        }

        let delay = outcome.next_tick(&self.settings);
        let monitor = Arc::downgrade(&self);
        self.scheduler.run_after(
            delay,
            Box::new(move || {
                if let Some(monitor) = monitor.upgrade() {
                    monitor.tick();
                }
            }),
        );
    }
}

/// Pulls candidate node URLs out of a `get_accounts` result.
///
/// The first account's `json_metadata` is itself a JSON document that may list `nodes`,
/// `failing_nodes` (an object keyed by URL) and `report` (objects with a `node` field). Any
/// of them may be missing. Only `https` URLs are returned, deduplicated and sorted.
pub fn harvest_node_urls(accounts: &Value) -> Vec<String> {
    let metadata = accounts
        .get(0)
        .and_then(|account| account.get("json_metadata"))
        .and_then(Value::as_str)
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok());
    let Some(metadata) = metadata else {
        return Vec::new();
    };

    let mut found = BTreeSet::new();
    if let Some(nodes) = metadata.get("nodes").and_then(Value::as_array) {
        found.extend(nodes.iter().filter_map(Value::as_str));
    }
    if let Some(failing) = metadata.get("failing_nodes").and_then(Value::as_object) {
        found.extend(failing.keys().map(String::as_str));
    }
    if let Some(report) = metadata.get("report").and_then(Value::as_array) {
        found.extend(
            report
                .iter()
                .filter_map(|entry| entry.get("node"))
                .filter_map(Value::as_str),
        );
    }

    found
        .into_iter()
        .filter(|candidate| {
            url::Url::parse(candidate)
                .map(|parsed| parsed.scheme() == "https")
                .unwrap_or(false)
        })
        .map(str::to_string)
        .collect()
}

/// Host injector backed by live health monitoring of a growing set of nodes.
///
/// The first start node is the default best node until something has been measured.
#[derive(Debug)]
pub struct HealthInjector {
    fastest: Arc<FastestNode>,
    monitors: Arc<MonitorSet>,
}

impl HealthInjector {
    pub fn start(
        start_nodes: &[String],
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        settings: MonitorSettings,
    ) -> Result<Self, ConfigError> {
        let Some(default_node) = start_nodes.first() else {
            return Err(ConfigError::Invalid(
                "health injector needs at least one start node".to_string(),
            ));
        };

        let fastest = Arc::new(FastestNode::with_grace(
            Some(default_node.clone()),
            settings.rescan_grace,
        ));
        let monitors = MonitorSet::new(fastest.clone(), transport, scheduler, settings)?;
        for node in start_nodes {
            monitors.process_node_url(node);
        }

        Ok(HealthInjector { fastest, monitors })
    }

    pub fn fastest(&self) -> &Arc<FastestNode> {
        &self.fastest
    }

    pub fn monitors(&self) -> &Arc<MonitorSet> {
        &self.monitors
    }

    pub fn register_forwarder(&self, sink: Weak<dyn HostSink>) -> SubscriptionId {
        self.fastest.subscribe(sink)
    }

    pub fn unregister_forwarder(&self, id: SubscriptionId) {
        self.fastest.unsubscribe(id)
    }
}

impl HostInjector for HealthInjector {
    fn subscribe(&self, sink: Weak<dyn HostSink>) -> SubscriptionId {
        self.register_forwarder(sink)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.unregister_forwarder(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TokioScheduler;
    use crate::test_support::{json_reply, text_reply, ScriptedTransport};
    use serde_json::json;

    const A: &str = "https://a.example";
    const B: &str = "https://b.example";
    const D: &str = "https://d.example";

    fn account_reply(requests: &[Value], metadata: Value) -> crate::transport::HttpReply {
        let entries: Vec<Value> = requests
            .iter()
            .map(|r| {
                json!({
                    "id": r["id"],
                    "result": [{"name": PROBE_ACCOUNT, "json_metadata": metadata.to_string()}]
                })
            })
            .collect();
        json_reply(200, Value::Array(entries))
    }

    fn calls_to(transport: &ScriptedTransport, url: &str) -> usize {
        transport.calls().iter().filter(|(u, _)| u == url).count()
    }

    fn start(transport: &Arc<ScriptedTransport>, nodes: &[&str]) -> HealthInjector {
        let nodes: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
        HealthInjector::start(
            &nodes,
            transport.clone(),
            Arc::new(TokioScheduler::current()),
            MonitorSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn harvest_merges_all_sources_and_keeps_https_only() {
        let metadata = json!({
            "nodes": [A, "http://plain.example", B],
            "failing_nodes": {D: "timeout", "wss://ws.example": "no"},
            "report": [{"node": B}, {"node": "not a url"}, {"other": 1}]
        });
        let accounts = json!([{"json_metadata": metadata.to_string()}]);
        assert_eq!(harvest_node_urls(&accounts), vec![A, B, D]);
    }

    #[test]
    fn harvest_tolerates_missing_pieces() {
        let partial = json!([{"json_metadata": json!({"nodes": [A]}).to_string()}]);
        assert_eq!(harvest_node_urls(&partial), vec![A]);

        assert!(harvest_node_urls(&json!([])).is_empty());
        assert!(harvest_node_urls(&json!([{"json_metadata": "not json"}])).is_empty());
        assert!(harvest_node_urls(&json!([{"json_metadata": ""}])).is_empty());
        assert!(harvest_node_urls(&json!({"unexpected": true})).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn discovers_advertised_nodes_and_picks_the_fastest() {
        let transport = Arc::new(
            ScriptedTransport::new(|_, url, requests| {
                let metadata = if url == A {
                    json!({
                        "nodes": [B, "http://insecure.example"],
                        "failing_nodes": {D: "slow"},
                        "report": [{"node": B}]
                    })
                } else {
                    json!({})
                };
                Ok(account_reply(requests, metadata))
            })
            .with_latency(|url| match url {
                A => Duration::from_millis(300),
                B => Duration::from_millis(100),
                _ => Duration::from_millis(200),
            }),
        );
        let injector = start(&transport, &[A]);

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(injector.monitors().urls(), vec![A, B, D]);
        assert_eq!(injector.fastest().best_url().as_deref(), Some(B));
        assert!(matches!(
            injector.monitors().last_outcome(D),
            Some(ProbeOutcome::Healthy(_))
        ));

        let probe = &transport.calls()[0].1[0];
        assert_eq!(probe["method"], "condenser_api.get_accounts");
        assert_eq!(probe["params"], json!([[PROBE_ACCOUNT]]));

        // Re-advertising a node does not create a second monitor.
        assert!(!injector.monitors().process_node_url(B));
        assert_eq!(injector.monitors().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_nodes_are_probed_every_minute() {
        let transport = Arc::new(ScriptedTransport::new(|_, _, requests| {
            Ok(account_reply(requests, json!({})))
        }));
        let _injector = start(&transport, &[A]);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(calls_to(&transport, A), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls_to(&transport, A), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_class_decides_the_retry_delay() {
        let transport = Arc::new(ScriptedTransport::new(|_, url, _| {
            Ok(if url == A {
                text_reply(404, "Not Found")
            } else {
                text_reply(503, "Service Unavailable")
            })
        }));
        let injector = start(&transport, &[A, B]);

        tokio::time::sleep(Duration::from_secs(29 * 60)).await;
        assert_eq!(injector.monitors().last_outcome(A), Some(ProbeOutcome::PermanentFailure));
        assert_eq!(injector.monitors().last_outcome(B), Some(ProbeOutcome::TemporaryFailure));
        assert_eq!(calls_to(&transport, A), 1);
        assert_eq!(calls_to(&transport, B), 1);

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        assert_eq!(calls_to(&transport, B), 2);
        assert_eq!(calls_to(&transport, A), 1);

        tokio::time::sleep(Duration::from_secs(6 * 60 * 60)).await;
        assert_eq!(calls_to(&transport, A), 2);

        // Neither node ever produced a sample.
        assert_eq!(injector.fastest().best_speed(), None);
        assert_eq!(injector.fastest().best_url().as_deref(), Some(A));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribed_forwarder_follows_the_fastest_node() {
        let transport = Arc::new(
            ScriptedTransport::new(|_, _, requests| Ok(account_reply(requests, json!({}))))
                .with_latency(|url| {
                    if url == B {
                        Duration::from_millis(50)
                    } else {
                        Duration::from_millis(400)
                    }
                }),
        );
        let injector = Arc::new(start(&transport, &[A, B]));

        let queue = HysteresisQueue::new(8, 10, Arc::new(TokioScheduler::current())).unwrap();
        let forwarder = BatchForwarder::spawn(
            RpcQueue::new(queue, None),
            HostSource::Injector(injector.clone()),
            transport.clone(),
            Arc::new(TokioScheduler::current()),
            ForwarderOptions::default(),
        );
        assert_eq!(forwarder.host(), None);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(forwarder.host().as_deref(), Some(B));
    }

    #[test]
    fn start_requires_a_node() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let transport = Arc::new(ScriptedTransport::new(|_, _, requests| {
            Ok(account_reply(requests, json!({})))
        }));
        let result = HealthInjector::start(
            &[],
            transport,
            Arc::new(TokioScheduler::new(runtime.handle().clone())),
            MonitorSettings::default(),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
