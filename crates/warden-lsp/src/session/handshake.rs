//! Construction of the `initialize` request and parsing of its result.

use std::path::Path;
use std::str::FromStr;

use lsp_types::Uri;
use serde_json::{Value, json};
use url::Url;

use crate::capability::{CapabilityFlags, FeatureSet};
use crate::descriptor::ServerDescriptor;
use crate::errors::SessionError;

/// Converts a filesystem path into a `file://` URI.
///
/// # Errors
///
/// Returns [`SessionError::Protocol`] for relative paths or paths that do
/// not form a valid URI.
pub fn file_uri(path: &Path) -> Result<Uri, SessionError> {
    let url = Url::from_file_path(path).map_err(|()| {
        SessionError::protocol(format!("{} is not an absolute path", path.display()))
    })?;
    Uri::from_str(url.as_str())
        .map_err(|error| SessionError::protocol(format!("invalid file URI {url}: {error}")))
}

/// Builds `InitializeParams` for `descriptor` rooted at `root`.
pub(crate) fn initialize_params(
    descriptor: &ServerDescriptor,
    root: &Path,
    client_name: &str,
) -> Result<Value, SessionError> {
    let root_uri = file_uri(root)?;
    let folder_name = root
        .file_name()
        .map_or_else(|| root.display().to_string(), |name| name.to_string_lossy().into_owned());

    let mut params = json!({
        "processId": std::process::id(),
        "rootPath": root.display().to_string(),
        "rootUri": root_uri.as_str(),
        "workspaceFolders": [{"uri": root_uri.as_str(), "name": folder_name}],
        "clientInfo": {"name": client_name, "version": env!("CARGO_PKG_VERSION")},
        "capabilities": client_capabilities(),
        "trace": "off",
    });
    if let Value::Object(object) = &mut params {
        if let Some(locale) = descriptor.locale() {
            object.insert(String::from("locale"), Value::String(locale.to_owned()));
        }
        if let Some(options) = descriptor.initialization_options() {
            object.insert(String::from("initializationOptions"), options.clone());
        }
    }
    Ok(params)
}

/// Client capabilities declared during the handshake.
fn client_capabilities() -> Value {
    json!({
        "general": {"positionEncodings": ["utf-16"]},
        "workspace": {
            "configuration": true,
            "workspaceFolders": true,
            "symbol": {"dynamicRegistration": false},
            "didChangeConfiguration": {"dynamicRegistration": true},
        },
        "textDocument": {
            "synchronization": {"dynamicRegistration": true, "didSave": true},
            "definition": {"dynamicRegistration": true, "linkSupport": true},
            "references": {"dynamicRegistration": true},
            "documentSymbol": {
                "dynamicRegistration": true,
                "hierarchicalDocumentSymbolSupport": true,
                "symbolKind": {"valueSet": (1..=26).collect::<Vec<u32>>()},
            },
            "hover": {"dynamicRegistration": true, "contentFormat": ["markdown", "plaintext"]},
            "completion": {
                "dynamicRegistration": true,
                "completionItem": {
                    "snippetSupport": false,
                    "documentationFormat": ["markdown", "plaintext"],
                },
            },
            "rename": {"dynamicRegistration": true, "prepareSupport": true},
            "formatting": {"dynamicRegistration": true},
            "diagnostic": {"dynamicRegistration": true, "relatedDocumentSupport": false},
            "callHierarchy": {"dynamicRegistration": true},
        },
        "window": {"workDoneProgress": true, "showMessage": {}},
    })
}

/// Extracts capability flags from an initialize result.
pub(crate) fn negotiate(
    result: &Value,
    opted_in: &FeatureSet,
) -> Result<CapabilityFlags, SessionError> {
    let capabilities = result
        .get("capabilities")
        .filter(|value| value.is_object())
        .ok_or_else(|| SessionError::protocol("initialize result has no capabilities object"))?;
    Ok(CapabilityFlags::negotiate(capabilities, opted_in))
}
