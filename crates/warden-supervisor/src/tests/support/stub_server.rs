//! Minimal in-process language server for registry tests.
//!
//! Answers `initialize` and `shutdown`, never answers [`HANG_METHOD`], and
//! records every launch command it is asked to spawn.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};
use warden_lsp::session::{FrameReader, FrameWriter};
use warden_lsp::{LaunchCommand, ServerProcess, ServerSpawner, SpawnedServer, StartupError};

/// Method the stub server never answers.
pub const HANG_METHOD: &str = "test/hang";

/// Spawner handing out stub servers instead of processes.
#[derive(Debug, Default)]
pub struct StubSpawner {
    handshake_delay: Duration,
    spawns: AtomicUsize,
    attempts: AtomicUsize,
    fail_spawns: AtomicBool,
    launches: Mutex<Vec<LaunchCommand>>,
}

impl StubSpawner {
    /// Servers answer `initialize` after `delay`.
    #[must_use]
    pub fn with_handshake_delay(delay: Duration) -> Self {
        Self {
            handshake_delay: delay,
            ..Self::default()
        }
    }

    /// Makes subsequent spawns fail as if the binary were missing.
    pub fn fail_spawns(&self) {
        self.fail_spawns.store(true, Ordering::SeqCst);
    }

    /// Number of servers started.
    #[must_use]
    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Number of spawn attempts, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Launch commands received, in order.
    #[must_use]
    pub fn launches(&self) -> Vec<LaunchCommand> {
        self.launches.lock().expect("launches lock").clone()
    }
}

impl ServerSpawner for StubSpawner {
    fn spawn(&self, command: &LaunchCommand) -> Result<SpawnedServer, StartupError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.launches
            .lock()
            .expect("launches lock")
            .push(command.clone());
        if self.fail_spawns.load(Ordering::SeqCst) {
            return Err(StartupError::BinaryNotFound {
                command: command.program.display().to_string(),
                source: Arc::new(io::Error::from(io::ErrorKind::NotFound)),
            });
        }
        let (server_stdin, client_writer) = io::pipe().expect("stdin pipe");
        let (client_reader, server_stdout) = io::pipe().expect("stdout pipe");
        let exited = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&exited);
        let delay = self.handshake_delay;
        thread::Builder::new()
            .name(String::from("stub-server"))
            .spawn(move || {
                serve(server_stdin, server_stdout, delay);
                flag.store(true, Ordering::SeqCst);
            })
            .expect("spawn stub server");
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(SpawnedServer {
            reader: Box::new(client_reader),
            writer: Box::new(client_writer),
            process: Box::new(StubProcess { exited }),
        })
    }
}

struct StubProcess {
    exited: Arc<AtomicBool>,
}

impl ServerProcess for StubProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_wait(&mut self) -> io::Result<bool> {
        Ok(self.exited.load(Ordering::SeqCst))
    }

    fn kill(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn wait(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn serve(stdin: io::PipeReader, stdout: io::PipeWriter, handshake_delay: Duration) {
    let mut reader = FrameReader::new(stdin);
    let mut writer = FrameWriter::new(stdout);
    while let Ok(frame) = reader.receive() {
        let Ok(message) = serde_json::from_slice::<Value>(&frame) else {
            continue;
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        let Some(id) = message.get("id").cloned() else {
            if method == "exit" {
                return;
            }
            continue;
        };
        let result = match method {
            "initialize" => {
                thread::sleep(handshake_delay);
                json!({
                    "capabilities": {"definitionProvider": true, "hoverProvider": true},
                    "serverInfo": {"name": "stub"},
                })
            }
            HANG_METHOD => continue,
            _ => Value::Null,
        };
        let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
        let payload = serde_json::to_vec(&reply).expect("encode reply");
        if writer.send(&payload).is_err() {
            return;
        }
    }
}
