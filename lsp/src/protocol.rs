//! Internal LSP message serde types and parameter builders.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LspError;
use crate::types::{Diagnostic, DiagnosticSeverity, Position, Range};

pub(crate) const JSONRPC_VERSION: &str = "2.0";

pub(crate) const METHOD_NOT_FOUND: i64 = -32601;
pub(crate) const INVALID_PARAMS: i64 = -32602;
pub(crate) const INTERNAL_ERROR: i64 = -32603;

pub(crate) const PUBLISH_DIAGNOSTICS: &str = "textDocument/publishDiagnostics";
pub(crate) const CANCEL_REQUEST: &str = "$/cancelRequest";

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// Error payload of a JSON-RPC response, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub(crate) fn into_lsp_error(self, method: &str) -> LspError {
        LspError::Protocol {
            method: method.to_string(),
            code: self.code,
            message: self.message,
        }
    }
}

pub(crate) fn response_ok(id: Value, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

pub(crate) fn response_err(id: Value, error: &ResponseError) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": error,
    })
}

/// Inbound message, classified by the presence of `id`, `method`, and
/// `result`/`error`.
#[derive(Debug)]
pub(crate) enum IncomingMessage {
    Response {
        id: u64,
        outcome: Result<Value, ResponseError>,
    },
    ServerRequest {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

pub(crate) fn classify(mut frame: Value) -> Option<IncomingMessage> {
    let object = frame.as_object_mut()?;
    let id = object.remove("id");
    let method = object
        .get("method")
        .and_then(Value::as_str)
        .map(String::from);
    let params = object.remove("params");
    let result = object.remove("result");
    let error = object.remove("error");

    match (id, method) {
        (Some(id), None) => {
            let id = id.as_u64()?;
            let outcome = match (result, error) {
                (_, Some(error)) => Err(serde_json::from_value(error.clone())
                    .unwrap_or_else(|_| ResponseError::new(INTERNAL_ERROR, error.to_string()))),
                (Some(result), None) => Ok(result),
                (None, None) => return None,
            };
            Some(IncomingMessage::Response { id, outcome })
        }
        (Some(id), Some(method)) => Some(IncomingMessage::ServerRequest { id, method, params }),
        (None, Some(method)) => Some(IncomingMessage::Notification { method, params }),
        (None, None) => None,
    }
}

/// Capabilities advertised during `initialize`. Fixed and exhaustive: the
/// client never registers capabilities dynamically.
pub(crate) fn client_capabilities() -> Value {
    serde_json::json!({
        "general": {
            "positionEncodings": ["utf-16"]
        },
        "window": {
            "workDoneProgress": true,
            "showMessage": { "messageActionItem": { "additionalPropertiesSupport": false } }
        },
        "workspace": {
            "applyEdit": true,
            "configuration": true,
            "workspaceFolders": true,
            "workspaceEdit": {
                "documentChanges": true,
                "resourceOperations": [],
                "failureHandling": "abort"
            },
            "didChangeConfiguration": { "dynamicRegistration": false },
            "didChangeWatchedFiles": { "dynamicRegistration": false },
            "symbol": { "dynamicRegistration": false }
        },
        "textDocument": {
            "synchronization": {
                "dynamicRegistration": false,
                "willSave": false,
                "willSaveWaitUntil": false,
                "didSave": true
            },
            "publishDiagnostics": {
                "relatedInformation": true,
                "versionSupport": true,
                "tagSupport": { "valueSet": [1, 2] },
                "codeDescriptionSupport": true,
                "dataSupport": true
            },
            "formatting": { "dynamicRegistration": false },
            "rangeFormatting": { "dynamicRegistration": false },
            "hover": {
                "dynamicRegistration": false,
                "contentFormat": ["markdown", "plaintext"]
            },
            "definition": { "dynamicRegistration": false, "linkSupport": true },
            "references": { "dynamicRegistration": false },
            "documentSymbol": {
                "dynamicRegistration": false,
                "hierarchicalDocumentSymbolSupport": true
            },
            "codeAction": {
                "dynamicRegistration": false,
                "codeActionLiteralSupport": {
                    "codeActionKind": {
                        "valueSet": ["quickfix", "refactor", "source.organizeImports"]
                    }
                }
            },
            "rename": { "dynamicRegistration": false, "prepareSupport": true }
        }
    })
}

pub(crate) fn initialize_params(
    root_uri: &str,
    root_path: &Path,
    initialization_options: Option<&Value>,
) -> Value {
    let name = root_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("workspace");
    let mut params = serde_json::json!({
        "processId": std::process::id(),
        "clientInfo": { "name": "quill", "version": env!("CARGO_PKG_VERSION") },
        "rootUri": root_uri,
        "rootPath": root_path.to_string_lossy(),
        "capabilities": client_capabilities(),
        "workspaceFolders": [{
            "uri": root_uri,
            "name": name
        }]
    });
    if let Some(options) = initialization_options {
        params["initializationOptions"] = options.clone();
    }
    params
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_save_params(uri: &str, text: Option<&str>) -> Value {
    let mut params = serde_json::json!({ "textDocument": { "uri": uri } });
    if let Some(text) = text {
        params["text"] = Value::String(text.to_string());
    }
    params
}

pub(crate) fn cancel_params(id: u64) -> Value {
    serde_json::json!({ "id": id })
}

/// Formatting options inferred from the document's own indentation.
pub(crate) fn formatting_params(uri: &str, content: &str) -> Value {
    let (tab_size, insert_spaces) = detect_indentation(content);
    serde_json::json!({
        "textDocument": { "uri": uri },
        "options": {
            "tabSize": tab_size,
            "insertSpaces": insert_spaces,
            "trimTrailingWhitespace": true,
            "insertFinalNewline": true,
            "trimFinalNewlines": true
        }
    })
}

fn detect_indentation(content: &str) -> (u32, bool) {
    let mut tab_lines = 0usize;
    let mut space_lines = 0usize;
    let mut two_space = 0usize;
    for line in content.lines() {
        if line.starts_with('\t') {
            tab_lines += 1;
        } else if line.starts_with(' ') {
            space_lines += 1;
            let width = line.len() - line.trim_start_matches(' ').len();
            if width % 4 != 0 && width % 2 == 0 {
                two_space += 1;
            }
        }
    }
    if tab_lines > space_lines {
        return (4, false);
    }
    if two_space > 0 && two_space * 2 >= space_lines {
        return (2, true);
    }
    (4, true)
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub(crate) struct LspPosition {
    pub line: u32,
    pub character: u32,
}

impl From<LspPosition> for Position {
    fn from(pos: LspPosition) -> Self {
        Position::new(pos.line, pos.character)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct LspRange {
    pub start: LspPosition,
    #[serde(default)]
    pub end: Option<LspPosition>,
}

impl From<LspRange> for Range {
    fn from(range: LspRange) -> Self {
        let start = Position::from(range.start);
        let end = range.end.map_or(start, Position::from);
        Range::new(start, end)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    #[serde(default)]
    pub version: Option<i32>,
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: LspRange,
    pub severity: Option<u64>,
    #[serde(default)]
    pub code: Option<Value>,
    pub source: Option<String>,
    pub message: String,
    #[serde(default)]
    pub tags: Option<Vec<u8>>,
}

impl LspDiagnostic {
    /// Convert to the public type; `fallback_source` names the server when
    /// the diagnostic carries no `source`.
    pub fn to_diagnostic(&self, fallback_source: &str) -> Diagnostic {
        let severity = self
            .severity
            .and_then(DiagnosticSeverity::from_lsp)
            .unwrap_or(DiagnosticSeverity::Warning);
        let source = self
            .source
            .clone()
            .unwrap_or_else(|| fallback_source.to_string());
        let mut diag = Diagnostic::new(severity, self.message.clone(), self.range.into(), source);
        match &self.code {
            Some(Value::String(code)) => diag = diag.with_code(code.clone()),
            Some(Value::Number(code)) => diag = diag.with_code(code.to_string()),
            _ => {}
        }
        if let Some(tags) = &self.tags {
            diag = diag.with_tags(tags.clone());
        }
        diag
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TextEdit {
    pub range: LspRange,
    pub new_text: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApplyWorkspaceEditParams {
    #[serde(default)]
    pub label: Option<String>,
    pub edit: WorkspaceEdit,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WorkspaceEdit {
    #[serde(default)]
    pub changes: Option<HashMap<String, Vec<TextEdit>>>,
    #[serde(default)]
    pub document_changes: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextDocumentEdit {
    text_document: TextDocumentIdentifier,
    edits: Vec<TextEdit>,
}

#[derive(Debug, Deserialize)]
struct TextDocumentIdentifier {
    uri: String,
}

impl WorkspaceEdit {
    /// Flatten into per-URI edit lists.
    ///
    /// Resource operations (create/rename/delete) are not supported and make
    /// the whole edit fail, since the capability advertises none.
    pub fn into_file_edits(self) -> Result<Vec<(String, Vec<TextEdit>)>, String> {
        let mut out: Vec<(String, Vec<TextEdit>)> = Vec::new();
        if let Some(document_changes) = self.document_changes {
            for change in document_changes {
                if change.get("kind").is_some() {
                    return Err("resource operations are not supported".to_string());
                }
                let edit: TextDocumentEdit = serde_json::from_value(change)
                    .map_err(|e| format!("invalid document change: {e}"))?;
                out.push((edit.text_document.uri, edit.edits));
            }
        } else if let Some(changes) = self.changes {
            let mut changes: Vec<_> = changes.into_iter().collect();
            changes.sort_by(|a, b| a.0.cmp(&b.0));
            out.extend(changes);
        }
        Ok(out)
    }
}

/// Apply protocol text edits to `text`.
///
/// Positions are UTF-16 based; columns past the end of a line clamp to the
/// line end and lines past the end clamp to the end of the document. All
/// offsets are resolved against the original text. Edits sharing a start
/// position keep their array order. Overlapping edits are rejected.
pub(crate) fn apply_text_edits(text: &str, edits: &[TextEdit]) -> Result<String, String> {
    if edits.is_empty() {
        return Ok(text.to_string());
    }

    let line_starts = line_starts(text);
    let mut resolved: Vec<(usize, usize, usize, &str)> = edits
        .iter()
        .enumerate()
        .map(|(idx, edit)| {
            let range = Range::from(edit.range);
            let start = offset_at(text, &line_starts, range.start);
            let end = offset_at(text, &line_starts, range.end).max(start);
            (start, idx, end, edit.new_text.as_str())
        })
        .collect();
    resolved.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, idx, end, new_text) in resolved {
        if start < cursor {
            return Err(format!(
                "text edit {idx} overlaps an earlier edit (offset {start} < {cursor})"
            ));
        }
        out.push_str(&text[cursor..start]);
        out.push_str(new_text);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}

fn line_starts(text: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(text.match_indices('\n').map(|(idx, _)| idx + 1))
        .collect()
}

fn offset_at(text: &str, line_starts: &[usize], pos: Position) -> usize {
    let Some(&line_start) = line_starts.get(pos.line as usize) else {
        return text.len();
    };
    let line_end = line_starts
        .get(pos.line as usize + 1)
        .copied()
        .unwrap_or(text.len());
    let raw_line = &text[line_start..line_end];
    let line = raw_line.strip_suffix('\n').unwrap_or(raw_line);
    let line = line.strip_suffix('\r').unwrap_or(line);

    let mut units = 0u32;
    for (idx, ch) in line.char_indices() {
        if units >= pos.character {
            return line_start + idx;
        }
        units += ch.len_utf16() as u32;
    }
    line_start + line.len()
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, LspError> {
    url::Url::from_file_path(path).map_err(|()| LspError::InvalidUri {
        path: path.to_path_buf(),
    })
}

pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}
