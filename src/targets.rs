//! Built-in local targets served to every connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};
use srpc_host::LifecycleDispatcher;
use srpc_protocol::{HandlerResult, RpcError};
use srpc_transport::{LocalTarget, RequestContext};
use tracing::info;

/// Wire up the demo targets and connection logging.
pub fn register(dispatcher: &mut LifecycleDispatcher) {
    dispatcher
        .add_local_target(|c| SessionTarget {
            context: c.context().clone(),
        })
        .add_default_local_target::<EchoTarget>()
        .on_ready(|c| {
            let context = c.context();
            context.notify(
                "session/ready",
                Some(json!({
                    "connectionId": context.id().as_str(),
                    "protocolVersion": context.protocol_version(),
                })),
            );
            Ok(())
        })
        .on_disconnect(|c, reason| {
            let calls = c.get::<EchoTarget>().map(|echo| echo.calls()).unwrap_or(0);
            info!(connection = %c.context().id(), %reason, echo_calls = calls, "session ended");
            Ok(())
        });
}

/// `session/*`: introspection and control of the calling connection.
pub struct SessionTarget {
    context: Arc<RequestContext>,
}

impl LocalTarget for SessionTarget {
    fn namespace(&self) -> &str {
        "session"
    }

    async fn handle(&self, method: &str, params: Option<Value>) -> HandlerResult {
        match method {
            "session/info" => Ok(json!({
                "connectionId": self.context.id().as_str(),
                "protocolVersion": self.context.protocol_version(),
                "peer": self.context.peer().map(|p| p.to_string()),
                "ageMs": self.context.age().as_millis() as u64,
            })),
            "session/notify" => {
                let event = params
                    .as_ref()
                    .and_then(|p| p.get("method"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("session/ping")
                    .to_string();
                let payload = params.and_then(|mut p| p.get_mut("params").map(Value::take));
                let delivered = self.context.notify(&event, payload);
                Ok(json!({ "delivered": delivered }))
            }
            "session/close" => Ok(json!({ "closing": self.context.dispose() })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }
}

/// `echo/*`: echoes params back and counts calls for this connection.
#[derive(Default)]
pub struct EchoTarget {
    calls: AtomicU64,
}

impl EchoTarget {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl LocalTarget for EchoTarget {
    fn namespace(&self) -> &str {
        "echo"
    }

    async fn handle(&self, method: &str, params: Option<Value>) -> HandlerResult {
        let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        match method {
            "echo/say" => Ok(params.unwrap_or(Value::Null)),
            "echo/count" => Ok(json!({ "calls": calls })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_counts_calls() {
        let echo = EchoTarget::default();
        assert_eq!(echo.handle("echo/say", Some(json!("hi"))).await.unwrap(), json!("hi"));
        assert_eq!(echo.handle("echo/count", None).await.unwrap(), json!({ "calls": 2 }));
        assert!(echo.handle("echo/nope", None).await.is_err());
        assert_eq!(echo.calls(), 3);
    }

    #[tokio::test]
    async fn session_info_reports_connection() {
        let context = Arc::new(RequestContext::detached("c1".into()));
        let target = SessionTarget { context: context.clone() };
        let info = target.handle("session/info", None).await.unwrap();
        assert_eq!(info["connectionId"], "c1");
        assert!(info["protocolVersion"].is_null());

        let closed = target.handle("session/close", None).await.unwrap();
        assert_eq!(closed["closing"], true);
        assert!(context.is_disposed());
    }

    #[test]
    fn register_binds_both_targets() {
        let mut dispatcher = LifecycleDispatcher::new();
        register(&mut dispatcher);
        assert_eq!(dispatcher.callback_count(srpc_host::LifecyclePhase::Connect), 2);
        assert_eq!(dispatcher.callback_count(srpc_host::LifecyclePhase::Ready), 1);
        assert_eq!(dispatcher.callback_count(srpc_host::LifecyclePhase::Disconnect), 1);
    }
}
