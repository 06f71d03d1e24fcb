//! In-process language server speaking LSP framing over OS pipes.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

use crate::errors::StartupError;
use crate::session::{
    FrameReader, FrameWriter, LaunchCommand, ServerProcess, ServerSpawner, SpawnedServer,
};

/// Method that makes the scripted server exit as if it crashed.
pub const CRASH_METHOD: &str = "test/crash";
/// Method the scripted server never answers.
pub const HANG_METHOD: &str = "test/hang";
/// Method answered with its own params.
pub const ECHO_METHOD: &str = "test/echo";

/// Behaviour of one scripted server incarnation.
#[derive(Debug, Clone)]
pub struct ServerScript {
    /// `capabilities` returned from `initialize`.
    pub capabilities: Value,
    /// Answer `initialize` at all.
    pub answer_initialize: bool,
    /// Pause before answering `initialize`.
    pub initialize_delay: Duration,
    /// Reject `initialize` with this message.
    pub initialize_error: Option<String>,
    /// Server-initiated messages sent after `initialized`.
    pub after_initialized: Vec<Value>,
    /// Items returned for `textDocument/diagnostic`.
    pub diagnostics: Vec<Value>,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            capabilities: json!({
                "definitionProvider": true,
                "referencesProvider": true,
                "hoverProvider": true,
                "diagnosticProvider": {
                    "interFileDependencies": false,
                    "workspaceDiagnostics": false,
                },
            }),
            answer_initialize: true,
            initialize_delay: Duration::ZERO,
            initialize_error: None,
            after_initialized: Vec::new(),
            diagnostics: Vec::new(),
        }
    }
}

impl ServerScript {
    /// A server that never answers `initialize`.
    #[must_use]
    pub fn silent() -> Self {
        Self {
            answer_initialize: false,
            ..Self::default()
        }
    }

    /// A server that answers `initialize` only after `delay`.
    #[must_use]
    pub fn slow(delay: Duration) -> Self {
        Self {
            initialize_delay: delay,
            ..Self::default()
        }
    }

    /// A server that rejects `initialize`.
    #[must_use]
    pub fn rejecting(message: &str) -> Self {
        Self {
            initialize_error: Some(message.to_owned()),
            ..Self::default()
        }
    }

    /// Reports `capabilities` from `initialize`.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Sends `message` once the client is initialised.
    #[must_use]
    pub fn then_send(mut self, message: Value) -> Self {
        self.after_initialized.push(message);
        self
    }

    /// Returns `items` from pull diagnostics.
    #[must_use]
    pub fn with_diagnostics(mut self, items: Vec<Value>) -> Self {
        self.diagnostics = items;
        self
    }
}

/// Every message the scripted servers received, across incarnations.
#[derive(Debug, Clone, Default)]
pub struct Transcript(Arc<Mutex<Vec<Value>>>);

impl Transcript {
    fn record(&self, message: Value) {
        self.0.lock().expect("transcript lock").push(message);
    }

    /// Methods of received requests and notifications, in order.
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        self.messages()
            .iter()
            .filter_map(|message| message.get("method").and_then(Value::as_str))
            .map(str::to_owned)
            .collect()
    }

    /// Client replies to server-initiated requests.
    #[must_use]
    pub fn replies(&self) -> Vec<Value> {
        self.messages()
            .into_iter()
            .filter(|message| message.get("method").is_none())
            .collect()
    }

    /// Raw received messages.
    #[must_use]
    pub fn messages(&self) -> Vec<Value> {
        self.0.lock().expect("transcript lock").clone()
    }
}

/// Spawner handing out scripted servers instead of processes.
#[derive(Debug, Default)]
pub struct ScriptedSpawner {
    scripts: Mutex<VecDeque<ServerScript>>,
    fallback: ServerScript,
    spawns: AtomicUsize,
    fail_spawns: AtomicBool,
    transcript: Transcript,
}

impl ScriptedSpawner {
    /// Every spawn runs `script`.
    #[must_use]
    pub fn new(script: ServerScript) -> Self {
        Self {
            fallback: script,
            ..Self::default()
        }
    }

    /// Runs `script` for the next spawn only.
    pub fn queue(&self, script: ServerScript) {
        self.scripts.lock().expect("script lock").push_back(script);
    }

    /// Makes subsequent spawns fail as if the binary were missing.
    pub fn fail_spawns(&self) {
        self.fail_spawns.store(true, Ordering::SeqCst);
    }

    /// Number of successful spawns so far.
    #[must_use]
    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Shared record of what the servers received.
    #[must_use]
    pub fn transcript(&self) -> Transcript {
        self.transcript.clone()
    }
}

impl ServerSpawner for ScriptedSpawner {
    fn spawn(&self, command: &LaunchCommand) -> Result<SpawnedServer, StartupError> {
        if self.fail_spawns.load(Ordering::SeqCst) {
            let display = command.program.display().to_string();
            return Err(StartupError::from_spawn(
                &display,
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }
        let script = self
            .scripts
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let (server_stdin, client_writer) = io::pipe().expect("stdin pipe");
        let (client_reader, server_stdout) = io::pipe().expect("stdout pipe");
        let exited = Arc::new(AtomicBool::new(false));
        let transcript = self.transcript.clone();
        let flag = Arc::clone(&exited);
        thread::Builder::new()
            .name(String::from("scripted-server"))
            .spawn(move || {
                serve(&script, server_stdin, server_stdout, &transcript);
                flag.store(true, Ordering::SeqCst);
            })
            .expect("spawn scripted server");
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(SpawnedServer {
            reader: Box::new(client_reader),
            writer: Box::new(client_writer),
            process: Box::new(ScriptedProcess { exited }),
        })
    }
}

struct ScriptedProcess {
    exited: Arc<AtomicBool>,
}

impl ServerProcess for ScriptedProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_wait(&mut self) -> io::Result<bool> {
        Ok(self.exited.load(Ordering::SeqCst))
    }

    fn kill(&mut self) -> io::Result<()> {
        // The thread stops once its stdin closes.
        Ok(())
    }

    fn wait(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn serve(
    script: &ServerScript,
    stdin: io::PipeReader,
    stdout: io::PipeWriter,
    transcript: &Transcript,
) {
    let mut reader = FrameReader::new(stdin);
    let mut writer = FrameWriter::new(stdout);
    let mut send = |message: &Value| {
        let payload = serde_json::to_vec(message).expect("encode");
        writer.send(&payload).is_ok()
    };
    while let Ok(frame) = reader.receive() {
        let Ok(message) = serde_json::from_slice::<Value>(&frame) else {
            continue;
        };
        transcript.record(message.clone());
        let id = message.get("id").cloned();
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let (Some(method), Some(id)) = (method.clone(), id) else {
            match method.as_deref() {
                Some("initialized") => {
                    for queued in &script.after_initialized {
                        send(queued);
                    }
                }
                Some("exit") => return,
                _ => {}
            }
            continue;
        };
        if method == "initialize" {
            thread::sleep(script.initialize_delay);
        }
        let reply = match method.as_str() {
            "initialize" if !script.answer_initialize => continue,
            "initialize" => match &script.initialize_error {
                Some(message) => error_reply(&id, -32603, message),
                None => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "capabilities": script.capabilities,
                        "serverInfo": {"name": "scripted"},
                    },
                }),
            },
            CRASH_METHOD => return,
            HANG_METHOD => continue,
            ECHO_METHOD => json!({"jsonrpc": "2.0", "id": id, "result": message.get("params")}),
            "shutdown" => json!({"jsonrpc": "2.0", "id": id, "result": null}),
            "textDocument/diagnostic" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"kind": "full", "items": script.diagnostics},
            }),
            other => error_reply(&id, -32601, &format!("unhandled {other}")),
        };
        if !send(&reply) {
            return;
        }
    }
}

fn error_reply(id: &Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}
