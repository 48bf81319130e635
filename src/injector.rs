//! Publish/subscribe seam between whatever decides which node to talk to and the forwarders
//! that talk to it.
//!
//! Subscribers are held weakly. An injector never keeps a forwarder alive, and a dropped
//! forwarder is simply skipped (and pruned) on the next notification.
use std::fmt::Debug;
use std::sync::Weak;

pub type SubscriptionId = u64;

/// Something that wants to be told which URL to send its next request to.
///
/// Injections are delivered one at a time, in the order they were decided. A sink must not
/// call back into the injector that is notifying it.
pub trait HostSink: Send + Sync {
    fn inject_host_url(&self, url: &str);
}

pub trait HostInjector: Send + Sync + Debug {
    /// Registers `sink` for host updates. If a host has already been chosen the sink is
    /// told about it right away.
    fn subscribe(&self, sink: Weak<dyn HostSink>) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);
}
