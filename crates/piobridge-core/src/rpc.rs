use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standing request that asks the home service for the next IDE command.
pub const LISTEN_COMMANDS_METHOD: &str = "ide.listen_commands";

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Builds a request with a fresh random id.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }

    pub fn listen_commands() -> Self {
        Self::new(LISTEN_COMMANDS_METHOD, None)
    }

    pub fn to_json(&self) -> String {
        // Only strings and already-valid JSON values; cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A decoded message received on the command channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Successful response carrying an IDE command.
    Command {
        id: Value,
        method: String,
        params: Value,
    },
    /// Error response.
    Failure { id: Value, error: RpcErrorObject },
    /// A request or notification from the server; the channel does not
    /// answer those.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcParseError {
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("unsupported jsonrpc version: {0}")]
    Version(String),
    #[error("result does not carry a command method")]
    MissingMethod,
    #[error("malformed error object: {0}")]
    ErrorObject(String),
    #[error("message is neither a response nor a request")]
    Unrecognized,
}

pub fn parse_inbound(text: &str) -> Result<Inbound, RpcParseError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| RpcParseError::Json(e.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(RpcParseError::NotAnObject);
    };

    match obj.get("jsonrpc") {
        None => {}
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(other) => return Err(RpcParseError::Version(other.to_string())),
    }

    let id = obj.get("id").cloned().unwrap_or(Value::Null);

    if let Some(result) = obj.get("result") {
        let method = result
            .get("method")
            .and_then(Value::as_str)
            .ok_or(RpcParseError::MissingMethod)?;
        let params = result
            .get("params")
            .filter(|p| !p.is_null())
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        return Ok(Inbound::Command {
            id,
            method: method.to_string(),
            params,
        });
    }

    if let Some(error) = obj.get("error") {
        let error = serde_json::from_value::<RpcErrorObject>(error.clone())
            .map_err(|e| RpcParseError::ErrorObject(e.to_string()))?;
        return Ok(Inbound::Failure { id, error });
    }

    if obj.get("method").is_some_and(Value::is_string) {
        return Ok(Inbound::Ignored);
    }

    Err(RpcParseError::Unrecognized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn listen_request_shape() {
        let req = RpcRequest::listen_commands();
        let v: Value = serde_json::from_str(&req.to_json()).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["method"], LISTEN_COMMANDS_METHOD);
        assert!(v.get("params").is_none());
        assert!(!v["id"].as_str().unwrap().is_empty());
    }

    #[test]
    fn request_ids_are_fresh() {
        let a = RpcRequest::listen_commands();
        let b = RpcRequest::listen_commands();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn parses_command_result() {
        let msg = parse_inbound(r#"{"id":"x","result":{"method":"m","params":{}}}"#).unwrap();
        assert_eq!(
            msg,
            Inbound::Command {
                id: json!("x"),
                method: "m".to_string(),
                params: json!({}),
            }
        );
    }

    #[test]
    fn missing_params_default_to_empty_object() {
        let msg =
            parse_inbound(r#"{"jsonrpc":"2.0","id":1,"result":{"method":"open_project"}}"#).unwrap();
        let Inbound::Command { params, .. } = msg else {
            panic!("expected command");
        };
        assert_eq!(params, json!({}));
    }

    #[test]
    fn parses_error_response() {
        let msg = parse_inbound(
            r#"{"jsonrpc":"2.0","id":"7","error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        let Inbound::Failure { error, .. } = msg else {
            panic!("expected failure");
        };
        assert_eq!(error.code, -32601);
        assert_eq!(error.message, "Method not found");
    }

    #[test]
    fn server_requests_are_ignored() {
        let msg = parse_inbound(r#"{"jsonrpc":"2.0","id":"1","method":"ping"}"#).unwrap();
        assert_eq!(msg, Inbound::Ignored);
    }

    #[test]
    fn rejects_malformed_messages() {
        assert!(matches!(parse_inbound("not json"), Err(RpcParseError::Json(_))));
        assert_eq!(parse_inbound("[1,2]"), Err(RpcParseError::NotAnObject));
        assert!(matches!(
            parse_inbound(r#"{"jsonrpc":"1.0","id":1,"result":{"method":"m"}}"#),
            Err(RpcParseError::Version(_))
        ));
        assert_eq!(
            parse_inbound(r#"{"id":1,"result":true}"#),
            Err(RpcParseError::MissingMethod)
        );
        assert!(matches!(
            parse_inbound(r#"{"id":1,"error":"boom"}"#),
            Err(RpcParseError::ErrorObject(_))
        ));
        assert_eq!(parse_inbound(r#"{"id":1}"#), Err(RpcParseError::Unrecognized));
    }
}
