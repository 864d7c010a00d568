//! RPC handler modules and registration.

pub mod agent;
pub mod approval;
pub mod events;
pub mod session;
pub mod subagent;
pub mod system;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::rpc::errors::RpcError;
use crate::rpc::registry::MethodRegistry;

/// Register all RPC handlers with the registry.
pub fn register_all(registry: &mut MethodRegistry) {
    // System
    registry.register("system.ping", system::PingHandler);
    registry.register("system.methods", system::MethodsHandler);

    // Session
    registry.register("session.create", session::CreateSessionHandler);
    registry.register("session.get", session::GetSessionHandler);
    registry.register("session.list", session::ListSessionsHandler);
    registry.register("session.reset", session::ResetSessionHandler);
    registry.register("session.subscribe", session::SubscribeHandler);

    // Agent
    registry.register("agent.run", agent::RunHandler);
    registry.register("agent.abort", agent::AbortHandler);
    registry.register("agent.wait", agent::WaitHandler);

    // Events
    registry.register("events.ingest", events::IngestHandler);

    // Subagents
    registry.register("subagent.register", subagent::RegisterHandler);
    registry.register("subagent.list", subagent::ListHandler);
    registry.register("subagent.stop", subagent::StopHandler);

    // Approvals
    registry.register("approval.request", approval::RequestHandler);
    registry.register("approval.wait", approval::WaitHandler);
    registry.register("approval.resolve", approval::ResolveHandler);
}

/// Deserialize the params object into `T`. Missing params read as `{}`.
pub(crate) fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let value = params.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    serde_json::from_value(value)
        .map_err(|e| RpcError::invalid_params(format!("Invalid params: {e}")))
}

/// Extract a required string parameter.
pub(crate) fn require_string_param(params: Option<&Value>, key: &str) -> Result<String, RpcError> {
    params
        .and_then(|p| p.get(key))
        .ok_or_else(|| RpcError::invalid_params(format!("Missing required parameter: {key}")))?
        .as_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| RpcError::invalid_params(format!("Parameter '{key}' must be a string")))
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::sync::Arc;

    use relay_runtime::{EchoExecutor, GatewayRuntime};
    use relay_settings::GatewaySettings;

    use crate::rpc::context::RpcContext;
    use crate::rpc::registry::MethodRegistry;

    /// Runtime with default settings and the echo executor.
    pub fn make_test_runtime() -> GatewayRuntime {
        GatewayRuntime::new(&GatewaySettings::default(), Arc::new(EchoExecutor))
    }

    /// Context over a fresh runtime, listing every registered method.
    pub fn make_test_context() -> RpcContext {
        let mut registry = MethodRegistry::new();
        super::register_all(&mut registry);
        RpcContext::new(make_test_runtime(), registry.methods())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn register_all_populates_registry() {
        let mut reg = MethodRegistry::new();
        register_all(&mut reg);
        for method in [
            "system.ping",
            "session.create",
            "agent.run",
            "events.ingest",
            "subagent.stop",
            "approval.resolve",
        ] {
            assert!(reg.has_method(method), "{method} not registered");
        }
        assert_eq!(reg.methods().len(), 17);
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        session_id: String,
        #[serde(default)]
        limit: Option<u32>,
    }

    #[test]
    fn parse_params_reports_missing_field() {
        let err = parse_params::<Sample>(None).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMS");
        assert!(err.to_string().contains("sessionId"));

        let ok: Sample = parse_params(Some(json!({ "sessionId": "s1" }))).unwrap();
        assert_eq!(ok.session_id, "s1");
        assert_eq!(ok.limit, None);
    }

    #[test]
    fn require_string_param_checks_type() {
        let params = json!({ "id": 5, "name": "x" });
        assert_eq!(require_string_param(Some(&params), "name").unwrap(), "x");
        assert!(require_string_param(Some(&params), "id").is_err());
        assert!(require_string_param(None, "name").is_err());
    }
}
