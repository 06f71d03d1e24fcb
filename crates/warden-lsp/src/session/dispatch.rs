//! Reader thread: routes every inbound message of one incarnation.

use std::io::{self, Read};
use std::sync::Arc;
use std::thread;

use lsp_types::{LogMessageParams, MessageType};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use super::jsonrpc::{IncomingMessage, JsonRpcError, JsonRpcReply};
use super::lifecycle::on_reader_exit;
use super::transport::FrameReader;
use super::{NOTIFICATION_CAPACITY, SESSION_TARGET, ServerNotification, Shared, lock};

/// Starts the reader thread for incarnation `generation`.
pub(super) fn spawn_reader(
    shared: Arc<Shared>,
    reader: Box<dyn Read + Send>,
    generation: u64,
) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("warden-lsp-{}", shared.descriptor.id()))
        .spawn(move || run(&shared, reader, generation))
        .map(|_| ())
}

fn run(shared: &Arc<Shared>, reader: Box<dyn Read + Send>, generation: u64) {
    let mut frames = FrameReader::new(reader);
    let cause = loop {
        match frames.receive() {
            Ok(frame) => dispatch(shared, &frame),
            Err(cause) => break cause,
        }
    };
    debug!(
        target: SESSION_TARGET,
        server = shared.descriptor.id(),
        generation,
        %cause,
        "language server stream closed"
    );
    on_reader_exit(shared, generation);
}

fn dispatch(shared: &Shared, frame: &[u8]) {
    let message = match IncomingMessage::from_bytes(frame) {
        Ok(message) => message,
        Err(error) => {
            warn!(
                target: SESSION_TARGET,
                server = shared.descriptor.id(),
                %error,
                "discarding malformed message"
            );
            return;
        }
    };
    match message {
        IncomingMessage::Response { id: Some(id), outcome } => {
            if !shared.pending.resolve(id, outcome) {
                debug!(target: SESSION_TARGET, id, "dropping response with no waiter");
            }
        }
        IncomingMessage::Response { id: None, .. } => {
            warn!(target: SESSION_TARGET, "dropping response without a numeric id");
        }
        IncomingMessage::ServerRequest { id, method, params } => {
            let outcome = answer_server_request(&method, &params);
            if let Err(error) = &outcome {
                debug!(
                    target: SESSION_TARGET,
                    method,
                    code = error.code,
                    "rejecting server request"
                );
            }
            match serde_json::to_vec(&JsonRpcReply::new(id, outcome)) {
                Ok(payload) => {
                    if let Err(error) = shared.write(&payload) {
                        debug!(
                            target: SESSION_TARGET,
                            method,
                            %error,
                            "failed to answer server request"
                        );
                    }
                }
                Err(error) => {
                    warn!(target: SESSION_TARGET, method, %error, "failed to encode reply");
                }
            }
        }
        IncomingMessage::Notification { method, params } => {
            handle_notification(shared, method, params);
        }
    }
}

/// Replies the client gives to requests initiated by the server.
fn answer_server_request(method: &str, params: &Value) -> Result<Value, JsonRpcError> {
    match method {
        "client/registerCapability"
        | "client/unregisterCapability"
        | "window/workDoneProgress/create" => Ok(Value::Null),
        "workspace/configuration" => {
            let items = params
                .get("items")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            Ok(Value::Array(vec![Value::Null; items]))
        }
        _ => Err(JsonRpcError::method_not_found(method)),
    }
}

fn handle_notification(shared: &Shared, method: String, params: Value) {
    match method.as_str() {
        "window/logMessage" | "window/showMessage" => log_server_message(shared, &params),
        "$/progress" | "textDocument/publishDiagnostics" => {
            trace!(target: SESSION_TARGET, method, "ignoring notification");
        }
        _ => {
            let mut queue = lock(&shared.notifications);
            if queue.len() >= NOTIFICATION_CAPACITY {
                queue.pop_front();
            }
            queue.push_back(ServerNotification { method, params });
        }
    }
}

fn log_server_message(shared: &Shared, params: &Value) {
    let Ok(message) = serde_json::from_value::<LogMessageParams>(params.clone()) else {
        debug!(target: SESSION_TARGET, "unreadable server log message");
        return;
    };
    let server = shared.descriptor.id();
    let text = message.message;
    if message.typ == MessageType::ERROR || message.typ == MessageType::WARNING {
        warn!(target: SESSION_TARGET, server, "{text}");
    } else if message.typ == MessageType::INFO {
        info!(target: SESSION_TARGET, server, "{text}");
    } else {
        debug!(target: SESSION_TARGET, server, "{text}");
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::session::METHOD_NOT_FOUND;

    #[rstest]
    #[case("client/registerCapability")]
    #[case("client/unregisterCapability")]
    #[case("window/workDoneProgress/create")]
    fn acknowledges_registration_requests(#[case] method: &str) {
        assert_eq!(answer_server_request(method, &Value::Null), Ok(Value::Null));
    }

    #[rstest]
    fn configuration_gets_one_null_per_item() {
        let params = json!({"items": [{"section": "a"}, {"section": "b"}]});

        assert_eq!(
            answer_server_request("workspace/configuration", &params),
            Ok(json!([null, null]))
        );
    }

    #[rstest]
    fn unknown_server_requests_are_rejected() {
        let reply = answer_server_request("workspace/applyEdit", &Value::Null);

        assert!(matches!(reply, Err(JsonRpcError { code, .. }) if code == METHOD_NOT_FOUND));
    }
}
