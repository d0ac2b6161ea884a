use std::{
    collections::BTreeMap,
    ffi::{OsStr, OsString},
    path::PathBuf,
    process::Stdio,
    sync::Mutex,
};

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::Instrument;

/// Bytes of stdout/stderr kept per stream; earlier output is dropped.
const OUTPUT_TAIL_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// File name of the program, e.g. `pip` for `/env/bin/pip`.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    pub fn display(&self) -> String {
        let mut out = self.program.to_string_lossy().into_owned();
        for a in &self.args {
            out.push(' ');
            out.push_str(&a.to_string_lossy());
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process could not be spawned or died from a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Converts a non-zero exit into an error labelled with `label`, carrying
    /// stderr (or stdout when stderr is empty).
    pub fn into_result(self, label: &str) -> anyhow::Result<String> {
        if self.success() {
            return Ok(self.stdout);
        }
        let detail = if !self.stderr.trim().is_empty() {
            self.stderr.trim().to_string()
        } else if !self.stdout.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            match self.code {
                Some(code) => format!("exit code {code}"),
                None => "terminated without exit code".to_string(),
            }
        };
        anyhow::bail!("{label}: {detail}")
    }
}

/// Boundary to the operating system's process table.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs to completion and captures output. A spawn failure is reported as
    /// an output without exit code whose stderr holds the OS error.
    async fn run(&self, cmd: &CommandSpec) -> CommandOutput;

    /// Starts a child that outlives the call. Returns its pid when known.
    async fn spawn_detached(&self, cmd: &CommandSpec) -> anyhow::Result<Option<u32>>;

    /// Adds directories in front of the search path of every later command.
    fn prepend_search_path(&self, dirs: &[PathBuf]);
}

#[derive(Debug, Default)]
pub struct SystemRunner {
    extra_path: Mutex<Vec<PathBuf>>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn search_path(&self) -> Option<OsString> {
        let extra = self
            .extra_path
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if extra.is_empty() {
            return None;
        }
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let all = extra
            .into_iter()
            .chain(std::env::split_paths(&inherited));
        std::env::join_paths(all).ok()
    }

    fn command(&self, spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        if let Some(path) = self.search_path() {
            cmd.env("PATH", path);
        }
        cmd.envs(&spec.env);
        cmd
    }
}

#[async_trait::async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> CommandOutput {
        let mut cmd = self.command(spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(command = %spec.display(), "run");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return CommandOutput {
                    code: None,
                    stdout: String::new(),
                    stderr: format!("spawn {}: {e}", spec.program.display()),
                };
            }
        };

        let stdout_task = child
            .stdout
            .take()
            .map(|s| tokio::spawn(read_tail(s, OUTPUT_TAIL_BYTES)));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(read_tail(s, OUTPUT_TAIL_BYTES)));

        let status = child.wait().await;
        let stdout = join_tail(stdout_task).await;
        let stderr = join_tail(stderr_task).await;

        match status {
            Ok(status) => {
                tracing::debug!(command = %spec.display(), %status, "finished");
                CommandOutput {
                    code: status.code(),
                    stdout,
                    stderr,
                }
            }
            Err(e) => CommandOutput {
                code: None,
                stdout,
                stderr: format!("wait {}: {e}", spec.program.display()),
            },
        }
    }

    async fn spawn_detached(&self, spec: &CommandSpec) -> anyhow::Result<Option<u32>> {
        let mut cmd = self.command(spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", spec.display()))?;
        let pid = child.id();

        // Reap the child so it does not linger as a zombie.
        let span = tracing::info_span!("detached", program = %spec.program_name(), pid = ?pid);
        tokio::spawn(
            async move {
                match child.wait().await {
                    Ok(status) => tracing::info!(%status, "detached process exited"),
                    Err(e) => tracing::warn!(error = %e, "wait for detached process"),
                }
            }
            .instrument(span),
        );
        Ok(pid)
    }

    fn prepend_search_path(&self, dirs: &[PathBuf]) {
        let mut extra = self.extra_path.lock().unwrap_or_else(|e| e.into_inner());
        let mut merged: Vec<PathBuf> = dirs.to_vec();
        merged.extend(extra.drain(..).filter(|d| !dirs.contains(d)));
        *extra = merged;
    }
}

async fn read_tail<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    limit_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
        if out.len() > limit_bytes {
            let excess = out.len() - limit_bytes;
            out.drain(..excess);
        }
    }
    Ok(out)
}

async fn join_tail(task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>) -> String {
    let Some(task) = task else {
        return String::new();
    };
    match task.await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => format!("<read error: {e}>"),
        Err(e) => format!("<join error: {e}>"),
    }
}
