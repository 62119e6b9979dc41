//! Answers requests initiated by the server.
//!
//! Servers block on some of their own requests (configuration lookups,
//! capability registration), so every request gets a reply: either a result
//! from the table below or `-32601 Method not found`.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::protocol::{self, ApplyWorkspaceEditParams, ResponseError};

pub type HandlerFut<'a> = Pin<Box<dyn Future<Output = Result<Value, ResponseError>> + Send + 'a>>;

/// Hook for server-initiated requests on one connection.
pub trait ServerRequestHandler: Send + Sync {
    fn handle<'a>(&'a self, method: &'a str, params: Option<Value>) -> HandlerFut<'a>;
}

/// The fixed dispatch table used for process-backed connections.
#[derive(Debug, Clone, Default)]
pub struct DefaultRequestHandler {
    server: String,
    settings: Option<Value>,
}

impl DefaultRequestHandler {
    #[must_use]
    pub fn new(server: impl Into<String>, settings: Option<Value>) -> Self {
        Self {
            server: server.into(),
            settings,
        }
    }

    /// One entry per requested item: the value at the item's dotted
    /// `section`, the whole settings object when no section is given, or
    /// `null` when nothing is configured there.
    fn configuration(&self, params: Option<Value>) -> Value {
        let sections: Vec<Option<String>> = params
            .as_ref()
            .and_then(|p| p.get("items"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| item.get("section").and_then(Value::as_str).map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let values = sections
            .into_iter()
            .map(|section| match (&self.settings, section) {
                (None, _) => Value::Null,
                (Some(settings), None) => settings.clone(),
                (Some(settings), Some(section)) => lookup_section(settings, &section),
            })
            .collect();
        Value::Array(values)
    }

    async fn apply_edit(&self, params: Option<Value>) -> Result<Value, ResponseError> {
        let params: ApplyWorkspaceEditParams = params
            .ok_or_else(|| ResponseError::invalid_params("missing params"))
            .and_then(|p| {
                serde_json::from_value(p).map_err(|e| ResponseError::invalid_params(e.to_string()))
            })?;

        let files = match params.edit.into_file_edits() {
            Ok(files) => files,
            Err(reason) => return Ok(apply_result(false, Some(reason))),
        };

        tracing::debug!(
            server = %self.server,
            label = params.label.as_deref().unwrap_or(""),
            files = files.len(),
            "applying workspace edit"
        );

        for (uri, edits) in files {
            let Some(path) = protocol::file_uri_to_path(&uri) else {
                return Ok(apply_result(false, Some(format!("not a file URI: {uri}"))));
            };
            let original = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) => {
                    return Ok(apply_result(
                        false,
                        Some(format!("{}: {e}", path.display())),
                    ));
                }
            };
            let updated = match protocol::apply_text_edits(&original, &edits) {
                Ok(updated) => updated,
                Err(reason) => {
                    return Ok(apply_result(
                        false,
                        Some(format!("{}: {reason}", path.display())),
                    ));
                }
            };
            if updated == original {
                continue;
            }
            let write_path = path.clone();
            let written = tokio::task::spawn_blocking(move || {
                quill_utils::atomic_write(&write_path, updated.as_bytes())
            })
            .await;
            match written {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Ok(apply_result(
                        false,
                        Some(format!("{}: {e}", path.display())),
                    ));
                }
                Err(e) => return Ok(apply_result(false, Some(e.to_string()))),
            }
        }
        Ok(apply_result(true, None))
    }
}

fn apply_result(applied: bool, failure_reason: Option<String>) -> Value {
    let mut result = serde_json::json!({ "applied": applied });
    if let Some(reason) = failure_reason {
        result["failureReason"] = Value::String(reason);
    }
    result
}

fn lookup_section(settings: &Value, section: &str) -> Value {
    if let Some(exact) = settings.get(section) {
        return exact.clone();
    }
    section
        .split('.')
        .try_fold(settings, |node, key| node.get(key))
        .cloned()
        .unwrap_or(Value::Null)
}

impl ServerRequestHandler for DefaultRequestHandler {
    fn handle<'a>(&'a self, method: &'a str, params: Option<Value>) -> HandlerFut<'a> {
        Box::pin(async move {
            match method {
                "workspace/configuration" => Ok(self.configuration(params)),
                "workspace/applyEdit" => self.apply_edit(params).await,
                "client/registerCapability"
                | "client/unregisterCapability"
                | "window/workDoneProgress/create" => Ok(Value::Null),
                _ => {
                    tracing::debug!(server = %self.server, method, "unhandled server request");
                    Err(ResponseError::method_not_found(method))
                }
            }
        })
    }
}
