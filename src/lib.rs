//! Client-side JSON-RPC fabric: a backpressured call queue, a batching forwarder and a
//! health monitor that keeps forwarders pointed at the fastest node.
pub mod completion;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod injector;
pub mod monitor;
pub mod queue;
pub mod rpc;
pub mod scheduler;
pub mod selector;
pub mod translator;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use completion::{CommandHandle, HandleState, Params, Task};
pub use config::Config;
pub use error::{ConfigError, RpcQueueError, TransportError, TransportErrorKind};
pub use forwarder::{BatchForwarder, ForwarderOptions, ForwarderState, HostSource};
pub use injector::{HostInjector, HostSink};
pub use monitor::{HealthInjector, MonitorSet, MonitorSettings};
pub use queue::{HysteresisQueue, QueueStats};
pub use scheduler::{Scheduler, TokioScheduler};
pub use selector::FastestNode;
pub use translator::RpcQueue;
pub use transport::{ReqwestTransport, Transport};
