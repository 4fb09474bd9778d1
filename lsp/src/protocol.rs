//! LSP message serde types and param builders.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use yls_types::{DiagnosticSeverity, RuleDiagnostic};

pub const COMPILE_RULE: &str = "yara.CompileRule";
pub const COMPILE_ALL_RULES: &str = "yara.CompileAllRules";

/// JSON-RPC "method not found".
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
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
    pub params: Option<serde_json::Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
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

/// The server only announces a capability when the client claims dynamic registration for it.
pub(crate) fn initialize_params(root_uri: Option<&str>) -> serde_json::Value {
    let workspace_folders = root_uri.map(|uri| {
        serde_json::json!([{
            "uri": uri,
            "name": "workspace"
        }])
    });
    serde_json::json!({
        "processId": std::process::id(),
        "clientInfo": { "name": "yls", "version": env!("CARGO_PKG_VERSION") },
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": true,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": true
                },
                "completion": { "dynamicRegistration": true },
                "definition": { "dynamicRegistration": true },
                "references": { "dynamicRegistration": true },
                "rename": { "dynamicRegistration": true },
                "formatting": { "dynamicRegistration": true },
                "publishDiagnostics": {
                    "relatedInformation": false
                }
            },
            "workspace": {
                "executeCommand": { "dynamicRegistration": true },
                "didChangeConfiguration": { "dynamicRegistration": false }
            }
        },
        "workspaceFolders": workspace_folders
    })
}

pub(crate) fn did_open_params(
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

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> serde_json::Value {
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

pub(crate) fn did_save_params(uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri }
    })
}

pub(crate) fn did_close_params(uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri }
    })
}

/// Settings are nested under the `yara` section, as the server reads them.
pub(crate) fn did_change_configuration_params(settings: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "settings": { "yara": settings }
    })
}

pub(crate) fn execute_command_params(
    command: &str,
    arguments: Vec<serde_json::Value>,
) -> serde_json::Value {
    serde_json::json!({
        "command": command,
        "arguments": arguments
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: LspRange,
    pub severity: Option<u64>,
    pub source: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspRange {
    pub start: LspPosition,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspPosition {
    pub line: u32,
    pub character: u32,
}

impl LspDiagnostic {
    pub fn to_rule_diagnostic(&self) -> RuleDiagnostic {
        RuleDiagnostic::new(
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            self.message.clone(),
            self.range.start.line,
            self.range.start.character,
            self.source.clone().unwrap_or_else(|| String::from("yara")),
        )
    }
}

/// `window/logMessage`, `window/showMessage` and the server's greeting on
/// `window/showMessageRequest` all carry this shape.
#[derive(Debug, Deserialize)]
pub(crate) struct MessageParams {
    #[serde(rename = "type")]
    pub kind: u8,
    pub message: String,
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

#[must_use]
pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_params_claim_dynamic_registration() {
        let params = initialize_params(Some("file:///rules"));
        assert!(params["processId"].is_number());
        assert_eq!(params["rootUri"], "file:///rules");
        assert_eq!(
            params["capabilities"]["workspace"]["executeCommand"]["dynamicRegistration"],
            true
        );
        assert_eq!(
            params["capabilities"]["textDocument"]["synchronization"]["didSave"],
            true
        );
        assert_eq!(params["workspaceFolders"][0]["uri"], "file:///rules");
    }

    #[test]
    fn initialize_params_without_root() {
        let params = initialize_params(None);
        assert!(params["rootUri"].is_null());
        assert!(params["workspaceFolders"].is_null());
    }

    #[test]
    fn document_params() {
        let open = did_open_params("file:///r/a.yara", "yara", 1, "rule a { condition: true }");
        assert_eq!(open["textDocument"]["languageId"], "yara");
        assert_eq!(open["textDocument"]["version"], 1);

        let change = did_change_params("file:///r/a.yara", 2, "rule a { condition: false }");
        assert_eq!(change["textDocument"]["version"], 2);
        assert_eq!(
            change["contentChanges"][0]["text"],
            "rule a { condition: false }"
        );

        assert_eq!(
            did_save_params("file:///r/a.yara")["textDocument"]["uri"],
            "file:///r/a.yara"
        );
    }

    #[test]
    fn configuration_is_nested_under_yara() {
        let params =
            did_change_configuration_params(serde_json::json!({"compile_on_save": true}));
        assert_eq!(params["settings"]["yara"]["compile_on_save"], true);
    }

    #[test]
    fn execute_command_shape() {
        let params = execute_command_params(COMPILE_RULE, vec![]);
        assert_eq!(params["command"], "yara.CompileRule");
        assert!(params["arguments"].as_array().unwrap().is_empty());
    }

    #[test]
    fn diagnostic_conversion_defaults() {
        let params: PublishDiagnosticsParams = serde_json::from_value(serde_json::json!({
            "uri": "file:///r/peek_rules.yara",
            "diagnostics": [{
                "range": { "start": { "line": 11, "character": 4 }, "end": { "line": 11, "character": 9 } },
                "message": "syntax error, unexpected <true>, expecting text string"
            }]
        }))
        .unwrap();
        let diag = params.diagnostics[0].to_rule_diagnostic();
        assert_eq!(diag.severity(), DiagnosticSeverity::Warning);
        assert_eq!(diag.line(), 11);
        assert_eq!(diag.col(), 4);
        assert_eq!(diag.source(), "yara");
    }

    #[test]
    fn request_omits_missing_params() {
        let json = serde_json::to_value(Request::new(1, "shutdown", None)).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "shutdown");
        assert!(json.get("params").is_none());

        let json = serde_json::to_value(Notification::new("exit", None)).unwrap();
        assert!(json.get("id").is_none());
        assert!(json.get("params").is_none());
    }

    #[test]
    fn method_not_found_reply() {
        let reply = method_not_found(&serde_json::json!(5), "workspace/configuration");
        assert_eq!(reply["id"], 5);
        assert_eq!(reply["error"]["code"], -32601);
        assert!(
            reply["error"]["message"]
                .as_str()
                .unwrap()
                .contains("workspace/configuration")
        );
    }

    #[cfg(unix)]
    #[test]
    fn file_uri_round_trip() {
        let path = PathBuf::from("/home/analyst/rules/peek_rules.yara");
        let uri = path_to_file_uri(&path).unwrap();
        assert_eq!(uri.as_str(), "file:///home/analyst/rules/peek_rules.yara");
        assert_eq!(file_uri_to_path(uri.as_str()), Some(path));
        assert!(file_uri_to_path("untitled:Untitled-1").is_none());
        assert!(path_to_file_uri(Path::new("relative/a.yara")).is_err());
    }
}
