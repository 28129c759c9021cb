//! JSON-RPC envelopes and inbound message classification.

use std::path::{Path, PathBuf};

use serde::Serialize;

/// JSON-RPC error code for a method the client does not implement.
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: serde_json::Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: serde_json::Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// Shape of a decoded inbound message.
#[derive(Debug, PartialEq)]
pub(crate) enum Incoming {
    /// Reply to one of our requests. `id` is `None` when the server sent an
    /// id we could never have issued (string, negative, fractional).
    Response {
        id: Option<u64>,
        outcome: Result<serde_json::Value, serde_json::Value>,
    },
    /// Server-to-client request; the id is in the server's namespace.
    ServerRequest {
        id: serde_json::Value,
        method: String,
    },
    Notification {
        method: String,
    },
    /// Neither id nor method.
    Other,
}

pub(crate) fn classify(message: &serde_json::Value) -> Incoming {
    let id = message.get("id").filter(|id| !id.is_null());
    let method = message
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);

    match (id, method) {
        (Some(id), Some(method)) => Incoming::ServerRequest {
            id: id.clone(),
            method,
        },
        (Some(id), None) => {
            let outcome = match message.get("error").filter(|e| !e.is_null()) {
                Some(error) => Err(error.clone()),
                None => Ok(message
                    .get("result")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null)),
            };
            Incoming::Response {
                id: id.as_u64(),
                outcome,
            }
        }
        (None, Some(method)) => Incoming::Notification { method },
        (None, None) => Incoming::Other,
    }
}

pub(crate) fn method_not_found(id: &serde_json::Value, method: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("Method not found: {method}")
        }
    })
}

pub fn initialize_params(root_uri: &str) -> serde_json::Value {
    serde_json::json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "didSave": false
                },
                "publishDiagnostics": {
                    "relatedInformation": false
                }
            }
        }
    })
}

pub fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}
