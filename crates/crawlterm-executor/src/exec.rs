//! Command execution against a per-request working directory.
//!
//! The executor keeps no session state: every command carries the directory
//! it runs in, and `cd` answers with the resolved directory instead of
//! remembering it.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crawlterm_protocol::ServerMessage;

use crate::config::ExecutorConfig;
use crate::error::{ExecError, ExecResult};

#[derive(Debug, Clone)]
pub struct Executor {
    root: PathBuf,
    confine: bool,
    timeout: Option<Duration>,
    max_line_bytes: usize,
    bin_dir: Option<PathBuf>,
}

impl Executor {
    pub fn new(config: &ExecutorConfig) -> ExecResult<Self> {
        let root = config
            .root
            .canonicalize()
            .map_err(|_| ExecError::NoSuchDirectory(config.root.display().to_string()))?;
        if !root.is_dir() {
            return Err(ExecError::NoSuchDirectory(root.display().to_string()));
        }
        Ok(Self {
            root,
            confine: config.confine_to_root,
            timeout: config.command_timeout(),
            max_line_bytes: config.max_output_line_bytes.max(1),
            bin_dir: config.bin_dir.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run one command line in `directory`, streaming replies into `out`.
    ///
    /// Failures are returned rather than sent so the caller decides how to
    /// report them; everything already sent stays sent.
    pub async fn run(
        &self,
        command: &str,
        directory: &str,
        out: &mpsc::Sender<ServerMessage>,
    ) -> ExecResult<()> {
        let words = shlex::split(command).ok_or(ExecError::UnbalancedQuotes)?;
        let (base, args) = words.split_first().ok_or(ExecError::EmptyCommand)?;
        let base = base.as_str();
        if !crawlterm_protocol::is_allowed(base) {
            return Err(ExecError::NotAllowed {
                command: base.to_string(),
                available: crawlterm_protocol::available_commands(),
            });
        }
        let workdir = self.working_dir(directory)?;

        match base {
            "cd" => {
                let target = args.first().map_or("", String::as_str);
                let target = self.change_directory(&workdir, target)?;
                emit(
                    out,
                    ServerMessage::DirectoryChanged {
                        directory: target.display().to_string(),
                    },
                )
                .await;
            }
            "pwd" => emit(out, ServerMessage::output(workdir.display().to_string())).await,
            "clear" => {}
            _ => self.spawn(base, args, &workdir, out).await?,
        }
        Ok(())
    }

    /// Directory a command supplied by the client runs in. Empty means root.
    pub fn working_dir(&self, directory: &str) -> ExecResult<PathBuf> {
        let directory = directory.trim();
        if directory.is_empty() || directory == "~" {
            return Ok(self.root.clone());
        }
        self.resolve(&self.root, directory)
    }

    /// Target of `cd <target>` issued from `from`.
    pub fn change_directory(&self, from: &Path, target: &str) -> ExecResult<PathBuf> {
        let target = target.trim();
        if target.is_empty() || target == "~" {
            return Ok(self.root.clone());
        }
        self.resolve(from, target)
    }

    fn resolve(&self, base: &Path, target: &str) -> ExecResult<PathBuf> {
        let candidate = match target.strip_prefix("~/") {
            Some(rest) => self.root.join(rest),
            None => base.join(target),
        };
        let resolved = candidate
            .canonicalize()
            .map_err(|_| ExecError::NoSuchDirectory(target.to_string()))?;
        if !resolved.is_dir() {
            return Err(ExecError::NoSuchDirectory(target.to_string()));
        }
        if self.confine && !resolved.starts_with(&self.root) {
            return Err(ExecError::OutsideRoot(target.to_string()));
        }
        Ok(resolved)
    }

    async fn spawn(
        &self,
        program: &str,
        args: &[String],
        workdir: &Path,
        out: &mpsc::Sender<ServerMessage>,
    ) -> ExecResult<()> {
        let executable = match &self.bin_dir {
            Some(dir) => dir.join(program),
            None => PathBuf::from(program),
        };
        let mut child = Command::new(&executable)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                command: program.to_string(),
                source,
            })?;
        debug!(program, workdir = %workdir.display(), pid = child.id(), "spawned");

        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.drain(&mut child, out))
                .await
                .ok(),
            None => Some(self.drain(&mut child, out).await),
        };
        let Some(status) = outcome else {
            warn!(program, "command timed out, killing it");
            if let Err(e) = child.kill().await {
                warn!(program, error = %e, "failed to kill timed out command");
            }
            return Err(ExecError::Timeout {
                command: program.to_string(),
                secs: self.timeout.map_or(0, |d| d.as_secs()),
            });
        };

        let status = status?;
        debug!(program, %status, "command finished");
        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Exited {
                command: program.to_string(),
                code: status.code(),
            })
        }
    }

    async fn drain(
        &self,
        child: &mut Child,
        out: &mpsc::Sender<ServerMessage>,
    ) -> std::io::Result<ExitStatus> {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let max = self.max_line_bytes;
        let (_, _, status) = tokio::join!(
            forward_lines(stdout, out, |content| ServerMessage::Output { content }, max),
            forward_lines(stderr, out, |content| ServerMessage::Error { content }, max),
            child.wait(),
        );
        status
    }
}

async fn emit(out: &mpsc::Sender<ServerMessage>, msg: ServerMessage) {
    if out.send(msg).await.is_err() {
        debug!("connection gone, reply dropped");
    }
}

/// Send one message per line of `reader`. Keeps reading after the
/// connection goes away so the child never blocks on a full pipe.
async fn forward_lines<R: AsyncRead + Unpin>(
    reader: Option<R>,
    out: &mpsc::Sender<ServerMessage>,
    make: fn(String) -> ServerMessage,
    max: usize,
) {
    let Some(reader) = reader else {
        return;
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut connected = true;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) if !connected => {}
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = truncate_line(text.trim_end_matches(['\n', '\r']), max);
                if out.send(make(line)).await.is_err() {
                    connected = false;
                }
            }
            Err(e) => {
                debug!(error = %e, "output stream ended");
                break;
            }
        }
    }
}

fn truncate_line(line: &str, max: usize) -> String {
    if line.len() <= max {
        return line.to_string();
    }
    let mut cut = max;
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... [{} bytes truncated]", &line[..cut], line.len() - cut)
}
