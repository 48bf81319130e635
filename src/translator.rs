//! # Call translator
//!
//! Turns `namespace.method(args)` style calls into [`Task`]s on a [`HysteresisQueue`] and
//! hands the caller a [`CommandHandle`] for the eventual result.
//!
//! The wire method is `"<outer>.<method>"` when an outer segment is given and the bare
//! method name otherwise. Calls that do not name an outer segment use the queue's default
//! namespace, if it has one.
use crate::completion::{CommandHandle, Params, Task};
use crate::error::RpcQueueError;
use crate::queue::{BatchReceiver, HysteresisQueue};
use serde_json::{Map, Value};

#[derive(Debug, Clone)]
pub struct RpcQueue {
    queue: HysteresisQueue,
    namespace: Option<String>,
}

impl RpcQueue {
    pub fn new(queue: HysteresisQueue, namespace: Option<String>) -> Self {
        RpcQueue { queue, namespace }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn queue(&self) -> &HysteresisQueue {
        &self.queue
    }

    /// Generic entry point. Keyed arguments win over positional ones when both are given.
    pub fn call(
        &self,
        outer: Option<&str>,
        method: &str,
        positional: Vec<Value>,
        keyed: Map<String, Value>,
    ) -> CommandHandle {
        let wire_method = match outer {
            Some(outer) if !outer.is_empty() => format!("{}.{}", outer, method),
            _ => method.to_string(),
        };
        let params = if keyed.is_empty() {
            Params::Positional(positional)
        } else {
            Params::Keyed(keyed)
        };

        let (task, mut handle) = Task::new(wire_method, params);
        if let Err(task) = self.queue.try_put(task) {
            tracing::debug!(method = %task.method, "Queue refused call");
            task.completion.fail(RpcQueueError::Capacity);
            // Settle the handle right away so the rejection is visible without awaiting.
            handle.state();
        }
        handle
    }

    /// Positional call in the default namespace.
    pub fn invoke(&self, method: &str, positional: Vec<Value>) -> CommandHandle {
        self.call(self.namespace.as_deref(), method, positional, Map::new())
    }

    /// Keyed call in the default namespace.
    pub fn invoke_named(&self, method: &str, keyed: Map<String, Value>) -> CommandHandle {
        self.call(self.namespace.as_deref(), method, Vec::new(), keyed)
    }

    /// View on one API namespace, e.g. `queue.api("block_api").call("get_block", ...)`.
    pub fn api<'a>(&'a self, outer: &'a str) -> ApiNamespace<'a> {
        ApiNamespace { queue: self, outer }
    }

    pub fn condenser_api(&self) -> CondenserApi<'_> {
        CondenserApi {
            api: self.api(CondenserApi::NAMESPACE),
        }
    }

    /// Consumer side, used by the forwarder.
    pub fn next_batch(&self, maxbatch: usize) -> BatchReceiver {
        self.queue.get(maxbatch)
    }

    /// Consumer side, used by the forwarder when a batch has to be retried.
    pub fn requeue(&self, batch: Vec<Task>) {
        self.queue.requeue(batch)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ApiNamespace<'a> {
    queue: &'a RpcQueue,
    outer: &'a str,
}

impl<'a> ApiNamespace<'a> {
    pub fn call(&self, method: &str, positional: Vec<Value>) -> CommandHandle {
        self.queue.call(Some(self.outer), method, positional, Map::new())
    }

    pub fn call_named(&self, method: &str, keyed: Map<String, Value>) -> CommandHandle {
        self.queue.call(Some(self.outer), method, Vec::new(), keyed)
    }
}

/// Typed wrapper over the handful of `condenser_api` calls this crate issues itself.
#[derive(Debug, Clone, Copy)]
pub struct CondenserApi<'a> {
    api: ApiNamespace<'a>,
}

impl<'a> CondenserApi<'a> {
    pub const NAMESPACE: &'static str = "condenser_api";

    pub fn get_accounts(&self, names: &[&str]) -> CommandHandle {
        let names: Vec<Value> = names.iter().map(|n| Value::String(n.to_string())).collect();
        self.api.call("get_accounts", vec![Value::Array(names)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::HandleState;
    use crate::scheduler::TokioScheduler;
    use serde_json::json;
    use std::sync::Arc;

    fn rpc_queue(low: usize, high: usize, namespace: Option<&str>) -> RpcQueue {
        let queue = HysteresisQueue::new(low, high, Arc::new(TokioScheduler::current())).unwrap();
        RpcQueue::new(queue, namespace.map(str::to_string))
    }

    #[tokio::test]
    async fn method_names_combine_outer_and_inner() {
        let q = rpc_queue(8, 10, Some("condenser_api"));
        let _a = q.invoke("get_block", vec![json!(1)]);
        let _b = q.api("block_api").call("get_block", vec![json!(2)]);
        let _c = q.call(None, "get_methods", vec![], Map::new());

        let batch = q.next_batch(10).await.unwrap();
        let methods: Vec<&str> = batch.iter().map(|t| t.method.as_str()).collect();
        assert_eq!(
            methods,
            vec!["condenser_api.get_block", "block_api.get_block", "get_methods"]
        );
    }

    #[tokio::test]
    async fn bare_calls_without_namespace_are_verbatim() {
        let q = rpc_queue(8, 10, None);
        let _h = q.invoke("get_block", vec![json!(1)]);
        let batch = q.next_batch(1).await.unwrap();
        assert_eq!(batch[0].method, "get_block");
    }

    #[tokio::test]
    async fn keyed_arguments_take_precedence() {
        let q = rpc_queue(8, 10, None);
        let mut keyed = Map::new();
        keyed.insert("block_num".into(), json!(12));
        let _h = q.call(Some("block_api"), "get_block", vec![json!(99)], keyed.clone());

        let batch = q.next_batch(1).await.unwrap();
        assert_eq!(batch[0].params, Params::Keyed(keyed));
    }

    #[tokio::test]
    async fn keyed_calls_go_out_as_objects() {
        let q = rpc_queue(8, 10, Some("condenser_api"));
        let mut by_block = Map::new();
        by_block.insert("block_num".into(), json!(7));
        let mut by_account = Map::new();
        by_account.insert("account".into(), json!("alice"));

        let _a = q.invoke_named("get_block", by_block);
        let _b = q.api("database_api").call_named("find_accounts", by_account.clone());

        let batch = q.next_batch(10).await.unwrap();
        assert_eq!(batch[0].method, "condenser_api.get_block");
        assert_eq!(batch[0].params.to_value(), json!({"block_num": 7}));
        assert_eq!(batch[1].method, "database_api.find_accounts");
        assert_eq!(batch[1].params, Params::Keyed(by_account));
    }

    #[tokio::test]
    async fn rejected_call_fails_with_capacity_error() {
        let q = rpc_queue(0, 1, Some("condenser_api"));
        let mut accepted = q.condenser_api().get_accounts(&["alice"]);
        let mut refused = q.condenser_api().get_accounts(&["bob"]);

        assert_eq!(accepted.state(), HandleState::Pending);
        assert_eq!(refused.state(), HandleState::Failed);
        assert!(matches!(refused.await, Err(RpcQueueError::Capacity)));

        let batch = q.next_batch(5).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].params, Params::Positional(vec![json!(["alice"])]));
    }
}
