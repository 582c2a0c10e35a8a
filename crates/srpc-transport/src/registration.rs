//! Per-connection request routing.
//!
//! A [`Registration`] is the capability handed to the host for one
//! connection: local targets bound on it receive every request whose method
//! namespace matches theirs. Targets are plain objects implementing
//! [`LocalTarget`]; the registration keeps them alive until it is unbound.

use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use srpc_protocol::{HandlerResult, RpcError, methods::namespace_of};
use tracing::{debug, warn};

use crate::context::ConnectionId;

/// An object that serves one method namespace for one connection.
///
/// `handle` receives the full method string (e.g. `"session/info"`).
pub trait LocalTarget: Send + Sync + 'static {
    /// The namespace prefix this target handles (e.g. `"session"`).
    fn namespace(&self) -> &str;

    /// Handle a request within this target's namespace.
    fn handle(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> impl std::future::Future<Output = HandlerResult> + Send;
}

/// Object-safe wrapper for the LocalTarget trait.
trait TargetDyn: Send + Sync {
    fn namespace_dyn(&self) -> &str;
    fn handle_dyn<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
    ) -> Pin<Box<dyn std::future::Future<Output = HandlerResult> + Send + 'a>>;
}

impl<T: LocalTarget> TargetDyn for T {
    fn namespace_dyn(&self) -> &str {
        self.namespace()
    }

    fn handle_dyn<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
    ) -> Pin<Box<dyn std::future::Future<Output = HandlerResult> + Send + 'a>> {
        Box::pin(self.handle(method, params))
    }
}

/// Routing table of the local targets bound to one connection.
pub struct Registration {
    connection: ConnectionId,
    targets: RwLock<Vec<Arc<dyn TargetDyn>>>,
}

impl Registration {
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            targets: RwLock::new(Vec::new()),
        }
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    /// Bind a target. A target already bound under the same namespace is replaced.
    pub fn register_local_target<T: LocalTarget>(&self, target: Arc<T>) {
        let target: Arc<dyn TargetDyn> = target;
        let namespace = target.namespace_dyn().to_string();
        let mut targets = self.targets.write();
        if let Some(pos) = targets.iter().position(|t| t.namespace_dyn() == namespace) {
            warn!(connection = %self.connection, namespace, "replacing bound local target");
            targets[pos] = target;
        } else {
            debug!(connection = %self.connection, namespace, "local target bound");
            targets.push(target);
        }
    }

    /// Route a request to the target owning its namespace.
    pub async fn route(&self, method: &str, params: Option<Value>) -> HandlerResult {
        let namespace = namespace_of(method);
        let target = {
            let targets = self.targets.read();
            targets.iter().find(|t| t.namespace_dyn() == namespace).cloned()
        };

        match target {
            Some(target) => target.handle_dyn(method, params).await,
            None => Err(RpcError::method_not_found(method)),
        }
    }

    pub fn is_bound(&self, namespace: &str) -> bool {
        self.targets.read().iter().any(|t| t.namespace_dyn() == namespace)
    }

    /// Namespaces in binding order.
    pub fn namespaces(&self) -> Vec<String> {
        self.targets
            .read()
            .iter()
            .map(|t| t.namespace_dyn().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }

    /// Drop every bound target. Returns how many were bound.
    pub fn unbind_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.targets.write());
        drained.len()
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("connection", &self.connection)
            .field("namespaces", &self.namespaces())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl LocalTarget for Echo {
        fn namespace(&self) -> &str {
            "echo"
        }

        async fn handle(&self, method: &str, params: Option<Value>) -> HandlerResult {
            Ok(json!({ "method": method, "params": params }))
        }
    }

    struct Fixed(&'static str, i64);

    impl LocalTarget for Fixed {
        fn namespace(&self) -> &str {
            self.0
        }

        async fn handle(&self, _method: &str, _params: Option<Value>) -> HandlerResult {
            Ok(json!(self.1))
        }
    }

    #[tokio::test]
    async fn routes_by_namespace() {
        let reg = Registration::new("c1".into());
        reg.register_local_target(Arc::new(Echo));
        reg.register_local_target(Arc::new(Fixed("num", 7)));

        let echoed = reg.route("echo/say", Some(json!("hi"))).await.unwrap();
        assert_eq!(echoed["method"], "echo/say");
        assert_eq!(echoed["params"], "hi");

        assert_eq!(reg.route("num/get", None).await.unwrap(), json!(7));
    }

    #[tokio::test]
    async fn unknown_namespace_is_method_not_found() {
        let reg = Registration::new("c1".into());
        reg.register_local_target(Arc::new(Echo));
        let err = reg.route("missing/x", None).await.unwrap_err();
        assert_eq!(err.error_code(), srpc_protocol::RpcErrorCode::MethodNotFound);
    }

    #[tokio::test]
    async fn rebinding_a_namespace_replaces_the_target() {
        let reg = Registration::new("c1".into());
        reg.register_local_target(Arc::new(Fixed("num", 1)));
        reg.register_local_target(Arc::new(Fixed("num", 2)));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.route("num/get", None).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn unbind_all_releases_targets() {
        let reg = Registration::new("c1".into());
        let target = Arc::new(Echo);
        reg.register_local_target(target.clone());
        assert_eq!(Arc::strong_count(&target), 2);
        assert_eq!(reg.namespaces(), vec!["echo".to_string()]);

        assert_eq!(reg.unbind_all(), 1);
        assert!(reg.is_empty());
        assert!(!reg.is_bound("echo"));
        assert_eq!(Arc::strong_count(&target), 1);
        assert!(reg.route("echo/say", None).await.is_err());
    }
}
