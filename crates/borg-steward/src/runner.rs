use std::collections::VecDeque;
use std::fmt;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// How many trailing stderr lines are kept for error messages.
const STDERR_TAIL_LINES: usize = 200;
const MAX_PENDING_BYTES: usize = 16 * 1024;

/// One external tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub env_remove: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Collect stdout into `CommandOutput::stdout` instead of streaming it.
    pub capture_stdout: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.env.push((k.into(), v.into()));
        self
    }

    pub fn env_remove(mut self, k: impl Into<String>) -> Self {
        self.env_remove.push(k.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }

    /// First positional argument, e.g. `create` for `borg create ...`.
    pub fn subcommand(&self) -> Option<&str> {
        self.args
            .iter()
            .find(|a| !a.starts_with('-'))
            .map(String::as_str)
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for CommandSpec {
    // Environment is omitted: it carries the passphrase.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for a in &self.args {
            write!(f, " {a}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr_tail: Vec<String>,
}

impl CommandOutput {
    pub fn ok() -> Self {
        Self {
            code: Some(0),
            ..Self::default()
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr_tail: stderr.lines().map(ToOwned::to_owned).collect(),
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stderr_text(&self) -> String {
        self.stderr_tail.join("\n")
    }

    /// Best human-readable failure detail: stderr, else the exit status.
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr_text();
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.code {
            Some(c) => format!("exit status {c}"),
            None => "terminated by signal".into(),
        }
    }
}

/// Narrow capability for running external tools. Lines are handed to `on_line` as they
/// arrive; the call returns once the process has exited.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        spec: &CommandSpec,
        on_line: &mut dyn FnMut(Stream, &str),
    ) -> Result<CommandOutput>;
}

/// Runs commands as real child processes.
#[derive(Debug, Default)]
pub struct ProcessRunner;

enum Chunk {
    Line(Stream, String),
    Captured(String),
}

impl CommandRunner for ProcessRunner {
    fn run(
        &self,
        spec: &CommandSpec,
        on_line: &mut dyn FnMut(Stream, &str),
    ) -> Result<CommandOutput> {
        debug!(command = %spec, "spawning");
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        for k in &spec.env_remove {
            cmd.env_remove(k);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        if let Some(dir) = spec.cwd.as_ref() {
            cmd.current_dir(dir);
        }

        // Child runs in its own process group.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::execution(format!("failed to spawn {}: {e}", spec.program)))?;

        let (tx, rx) = mpsc::channel::<Chunk>();
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            let capture = spec.capture_stdout;
            readers.push(std::thread::spawn(move || {
                if capture {
                    read_all(out, tx)
                } else {
                    read_lines(out, Stream::Stdout, tx)
                }
            }));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || {
                read_lines(err, Stream::Stderr, tx)
            }));
        }
        drop(tx);

        let mut output = CommandOutput::default();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        for chunk in rx {
            match chunk {
                Chunk::Captured(s) => output.stdout = s,
                Chunk::Line(stream, line) => {
                    if stream == Stream::Stderr {
                        if tail.len() >= STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.clone());
                    }
                    on_line(stream, &line);
                }
            }
        }
        for r in readers {
            if r.join().is_err() {
                warn!(command = %spec, "output reader thread panicked; output may be incomplete");
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::execution(format!("wait for {} failed: {e}", spec.program)))?;
        output.code = status.code();
        output.stderr_tail = tail.into_iter().collect();
        debug!(command = %spec, code = ?output.code, "exited");
        Ok(output)
    }
}

/// Logs what would run and reports success without spawning anything.
#[derive(Debug, Default)]
pub struct DryRunRunner;

impl CommandRunner for DryRunRunner {
    fn run(
        &self,
        spec: &CommandSpec,
        _on_line: &mut dyn FnMut(Stream, &str),
    ) -> Result<CommandOutput> {
        info!("DRY-RUN: {spec}");
        let stdout = if spec.capture_stdout { "{}" } else { "" };
        Ok(CommandOutput::ok().with_stdout(stdout))
    }
}

fn read_all<R: Read>(reader: R, tx: mpsc::Sender<Chunk>) {
    let mut r = BufReader::new(reader);
    let mut buf = Vec::new();
    let _ = r.read_to_end(&mut buf);
    let _ = tx.send(Chunk::Captured(String::from_utf8_lossy(&buf).into_owned()));
}

fn read_lines<R: Read>(reader: R, stream: Stream, tx: mpsc::Sender<Chunk>) {
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    let flush = |pending: &mut Vec<u8>| {
        let line = String::from_utf8_lossy(pending).into_owned();
        pending.clear();
        tx.send(Chunk::Line(stream, line)).is_ok()
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for b in &buf[..n] {
            // Progress output rewrites the line with '\r'; treat it as a line break.
            if *b == b'\n' || *b == b'\r' {
                if !pending.is_empty() && !flush(&mut pending) {
                    return;
                }
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES && !flush(&mut pending) {
                    return;
                }
            }
        }
    }
    if !pending.is_empty() {
        flush(&mut pending);
    }
}
