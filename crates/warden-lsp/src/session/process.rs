//! Spawning and terminating language server processes.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::StartupError;

/// Log target for process management.
pub(crate) const PROCESS_TARGET: &str = "warden_lsp::process";

/// Fully resolved command used to launch a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Executable path or command name.
    pub program: PathBuf,
    /// Arguments in order.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory; the project root.
    pub working_dir: PathBuf,
}

impl LaunchCommand {
    /// Creates a command with no arguments or extra environment.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: working_dir.into(),
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Handle on a running server process.
pub trait ServerProcess: Send {
    /// OS process id, when there is one.
    fn id(&self) -> Option<u32>;
    /// Returns `true` once the process has exited.
    ///
    /// # Errors
    ///
    /// Propagates failures to query the process status.
    fn try_wait(&mut self) -> io::Result<bool>;
    /// Forcibly stops the process.
    ///
    /// # Errors
    ///
    /// Propagates failures to signal the process.
    fn kill(&mut self) -> io::Result<()>;
    /// Blocks until the process has exited.
    ///
    /// # Errors
    ///
    /// Propagates failures to reap the process.
    fn wait(&mut self) -> io::Result<()>;
}

/// Streams and handle produced by a spawn.
pub struct SpawnedServer {
    /// Server stdout.
    pub reader: Box<dyn Read + Send>,
    /// Server stdin.
    pub writer: Box<dyn Write + Send>,
    /// Process handle.
    pub process: Box<dyn ServerProcess>,
}

/// Produces server processes; replaced by scripted servers in tests.
pub trait ServerSpawner: Send + Sync {
    /// Spawns the process described by `command`.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError`] when the process cannot be started.
    fn spawn(&self, command: &LaunchCommand) -> Result<SpawnedServer, StartupError>;
}

/// Spawns real processes via [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSpawner;

impl ServerSpawner for ProcessSpawner {
    fn spawn(&self, launch: &LaunchCommand) -> Result<SpawnedServer, StartupError> {
        let program_display = launch.program.display().to_string();
        debug!(
            target: PROCESS_TARGET,
            command = %program_display,
            args = ?launch.args,
            cwd = %launch.working_dir.display(),
            "spawning language server process"
        );

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .envs(launch.env.iter().map(|(key, value)| (key, value)))
            .current_dir(&launch.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|error| StartupError::from_spawn(&program_display, error))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StartupError::missing_pipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StartupError::missing_pipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            drain_stderr(stderr, program_display.clone());
        }

        debug!(
            target: PROCESS_TARGET,
            command = %program_display,
            pid = child.id(),
            "language server process spawned"
        );

        Ok(SpawnedServer {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Box::new(ChildProcess(child)),
        })
    }
}

/// Forwards server stderr to the debug log until the stream closes.
fn drain_stderr(stderr: impl Read + Send + 'static, command: String) {
    let spawned = thread::Builder::new()
        .name(String::from("warden-lsp-stderr"))
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => debug!(target: PROCESS_TARGET, command = %command, "{line}"),
                    Err(_) => break,
                }
            }
        });
    if let Err(error) = spawned {
        warn!(target: PROCESS_TARGET, %error, "failed to start stderr drain thread");
    }
}

struct ChildProcess(Child);

impl ServerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        Some(self.0.id())
    }

    fn try_wait(&mut self) -> io::Result<bool> {
        self.0.try_wait().map(|status| status.is_some())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.0.kill()
    }

    fn wait(&mut self) -> io::Result<()> {
        self.0.wait().map(|_| ())
    }
}

/// Waits up to `grace` for the process to exit, then kills it.
pub(crate) fn terminate_process(process: &mut dyn ServerProcess, grace: Duration, label: &str) {
    match process.try_wait() {
        Ok(true) => {
            debug!(target: PROCESS_TARGET, server = label, "language server exited");
            return;
        }
        Ok(false) => {}
        Err(error) => {
            warn!(
                target: PROCESS_TARGET,
                server = label,
                %error,
                "failed to check process status, waiting before killing"
            );
        }
    }

    thread::sleep(grace);
    if matches!(process.try_wait(), Ok(true)) {
        debug!(
            target: PROCESS_TARGET,
            server = label,
            "language server exited during grace period"
        );
        return;
    }

    warn!(
        target: PROCESS_TARGET,
        server = label,
        pid = ?process.id(),
        "language server did not exit gracefully, killing"
    );
    if let Err(error) = process.kill() {
        debug!(target: PROCESS_TARGET, server = label, %error, "kill failed");
    }
    if let Err(error) = process.wait() {
        debug!(target: PROCESS_TARGET, server = label, %error, "wait failed");
    }
}

/// Resolves the Java launcher from `JAVA_HOME`, falling back to `java` on `PATH`.
#[must_use]
pub fn java_executable(java_home: Option<&Path>) -> PathBuf {
    java_home.map_or_else(
        || PathBuf::from("java"),
        |home| home.join("bin").join(if cfg!(windows) { "java.exe" } else { "java" }),
    )
}
