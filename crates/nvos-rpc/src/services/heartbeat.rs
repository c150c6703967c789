use async_trait::async_trait;
use serde_json::Value;

use super::{reply, unknown_method, RpcService};
use crate::messages::Empty;
use crate::status::Status;

/// Keep-alive for clients.
pub struct HeartbeatService;

#[async_trait]
impl RpcService for HeartbeatService {
    fn name(&self) -> &'static str {
        "Heartbeat"
    }

    fn methods(&self) -> &'static [&'static str] {
        &["Ping"]
    }

    async fn call(&self, method: &str, _payload: Value) -> Result<Value, Status> {
        match method {
            "Ping" => reply(Empty {}),
            _ => Err(unknown_method(self.name(), method)),
        }
    }
}
