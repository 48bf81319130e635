//! # fabric-watch
//! Keeps an eye on a set of JSON-RPC full nodes and logs which one is currently the fastest.
//!
//! Starting from the configured seed nodes it follows every node advertised in the
//! `fullnodeupdate` account metadata, probes each one periodically and logs every change of
//! the fastest node. A forwarder subscribed to that choice sends a heartbeat call through the
//! regular queue so the whole path is exercised.
//!
//! # Configure
//! Edit `src/config.json`, or pass another config file as the first argument.
//! ```json
//! {
//!     "forwarder": { "use_health_injector": true },
//!     "monitor": { "seed_nodes": ["https://api.steemit.com"] }
//! }
//! ```
//! Set `RUST_LOG` to override the configured `log_level`.
//!
//! # Run
//! ```bash
//! cargo run -- src/config.json
//! ```
use rpc_fabric::{
    BatchForwarder, Config, HealthInjector, HostInjector, HostSink, HostSource, HysteresisQueue,
    ReqwestTransport, RpcQueue, Scheduler, TokioScheduler, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HEARTBEAT_METHOD: &str = "get_dynamic_global_properties";

/// Logs every best node announcement.
struct BestNodeLog;

impl HostSink for BestNodeLog {
    fn inject_host_url(&self, url: &str) {
        tracing::info!(url, "Fastest node is now");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let configs = match std::env::args().nth(1) {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .unwrap_or_else(|err| {
        eprintln!("Failed to load config: {}", err);
        std::process::exit(1);
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&configs.log_level))
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "fabric-watch starting");

    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current());
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(
        &configs.forwarder.user_agent,
        configs.request_timeout(),
    )?);

    let mut injector = None;
    let host = match &configs.forwarder.host_url {
        Some(url) => HostSource::Static(url.clone()),
        None => {
            let health = Arc::new(HealthInjector::start(
                &configs.monitor.seed_nodes,
                transport.clone(),
                scheduler.clone(),
                configs.monitor_settings(),
            )?);
            injector = Some(health.clone());
            HostSource::Injector(health)
        }
    };

    let best_node_log: Arc<dyn HostSink> = Arc::new(BestNodeLog);
    if let Some(health) = &injector {
        health.subscribe(Arc::downgrade(&best_node_log));
    }

    let queue = HysteresisQueue::new(configs.queue.low, configs.queue.high, scheduler.clone())?;
    let queue = RpcQueue::new(queue, configs.queue.namespace.clone());
    let forwarder = BatchForwarder::spawn(
        queue.clone(),
        host,
        transport,
        scheduler,
        configs.forwarder_options(),
    );

    let interval = Duration::from_secs(configs.monitor.ok_interval_sec.max(1));
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match queue.invoke(HEARTBEAT_METHOD, Vec::new()).await {
                Ok(props) => tracing::info!(
                    head_block = %props["head_block_number"],
                    node = ?forwarder.host(),
                    "Heartbeat"
                ),
                Err(e) => tracing::warn!(error = %e, node = ?forwarder.host(), "Heartbeat failed"),
            }
            if let Some(health) = &injector {
                tracing::debug!(nodes = health.monitors().len(), "Monitored nodes");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    heartbeat.abort();
    Ok(())
}
