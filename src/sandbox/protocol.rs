//! Line protocol between a kernel and its in-container interpreter.
//!
//! Each request is one line of base64-encoded source. After running it the
//! driver writes `\n<marker> <exit code>\n` to stdout and `\n<marker>\n` to
//! stderr. The marker is random per kernel and passed as the driver's last
//! argument, so user output cannot forge a terminator by accident.

use super::error::SandboxError;
use super::kernel::Language;
use super::runtime::{ContainerRef, ContainerRuntime, ExecSession, OutputChunk};
use crate::utils::lossy_prefix;
use base64::Engine;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Python driver: one persistent globals dict, tracebacks to stderr, and the
/// `repr` of a trailing expression echoed the way an interactive kernel does
pub const PYTHON_DRIVER: &str = r#"import ast, base64, os, sys, traceback
marker = sys.argv[-1]
requests = sys.stdin
sys.stdin = open(os.devnull)
scope = {"__name__": "__main__", "__builtins__": __builtins__}
def run(source):
    tree = ast.parse(source, "<kernel>", "exec")
    tail = None
    if tree.body and isinstance(tree.body[-1], ast.Expr):
        tail = ast.Expression(tree.body.pop().value)
    exec(compile(tree, "<kernel>", "exec"), scope)
    if tail is not None:
        value = eval(compile(tail, "<kernel>", "eval"), scope)
        if value is not None:
            print(repr(value))
for line in requests:
    line = line.strip()
    if not line:
        continue
    rc = 0
    try:
        run(base64.b64decode(line).decode("utf-8"))
    except SystemExit as exc:
        rc = exc.code if isinstance(exc.code, int) else (0 if exc.code is None else 1)
    except BaseException:
        traceback.print_exc()
        rc = 1
    try:
        sys.stdout.flush()
        sys.stderr.flush()
    except Exception:
        pass
    sys.__stdout__.write("\n%s %d\n" % (marker, rc))
    sys.__stdout__.flush()
    sys.__stderr__.write("\n%s\n" % marker)
    sys.__stderr__.flush()
"#;

/// Bash driver: one persistent shell, snippets never see the protocol stdin
pub const BASH_DRIVER: &str = r#"__oxide_marker="$1"
while IFS= read -r __oxide_line; do
  [ -z "$__oxide_line" ] && continue
  eval "$(printf '%s' "$__oxide_line" | base64 -d)" </dev/null
  __oxide_rc=$?
  printf '\n%s %d\n' "$__oxide_marker" "$__oxide_rc"
  printf '\n%s\n' "$__oxide_marker" >&2
done
"#;

/// Generate a fresh per-kernel marker
#[must_use]
pub fn new_marker() -> String {
    format!("__OXIDE_{}__", Uuid::new_v4().simple())
}

/// Encode one snippet as a request line
#[must_use]
pub fn encode_request(code: &str) -> String {
    let mut line = base64::engine::general_purpose::STANDARD.encode(code.as_bytes());
    line.push('\n');
    line
}

/// Output of one snippet as reported by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReply {
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Driver-reported exit status
    pub exit_code: i64,
    /// Either stream exceeded the cap
    pub truncated: bool,
}

/// Accumulates one stream until its terminator, keeping at most `cap` bytes of content
#[derive(Debug)]
struct StreamBuf {
    data: Vec<u8>,
    cap: usize,
    window: usize,
    dropped: bool,
    scanned: usize,
}

impl StreamBuf {
    fn new(cap: usize, marker_len: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            // "\n" + marker + " " + i64 digits + "\n"
            window: marker_len + 24,
            dropped: false,
            scanned: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Drop bytes past the cap that can no longer be part of a terminator
    fn compact(&mut self) {
        let keep_from = self.data.len().saturating_sub(self.window);
        if keep_from > self.cap {
            self.data.drain(self.cap..keep_from);
            self.dropped = true;
            self.scanned = self.scanned.min(self.cap);
        }
    }

    fn find(&mut self, needle: &[u8]) -> Option<usize> {
        let start = self.scanned.saturating_sub(needle.len());
        let found = self.data[start..]
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|p| p + start);
        if found.is_none() {
            self.scanned = self.data.len();
        }
        found
    }

    fn content(&self, end: usize) -> (String, bool) {
        let (text, cut) = lossy_prefix(&self.data[..end], self.cap);
        (text, cut || self.dropped)
    }
}

/// Incremental parser for one request's reply
#[derive(Debug)]
pub struct ReplyCollector {
    needle: Vec<u8>,
    stdout: StreamBuf,
    stderr: StreamBuf,
    exit: Option<(usize, i64)>,
    stderr_end: Option<usize>,
}

impl ReplyCollector {
    /// Collector for `marker`, keeping at most `cap` bytes per stream
    #[must_use]
    pub fn new(marker: &str, cap: usize) -> Self {
        let needle = format!("\n{marker}").into_bytes();
        Self {
            stdout: StreamBuf::new(cap, needle.len()),
            stderr: StreamBuf::new(cap, needle.len()),
            needle,
            exit: None,
            stderr_end: None,
        }
    }

    /// Feed one chunk
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Container` when the stdout terminator is malformed.
    pub fn push(&mut self, chunk: &OutputChunk) -> Result<(), SandboxError> {
        match chunk {
            OutputChunk::Stdout(bytes) if self.exit.is_none() => {
                self.stdout.push(bytes);
                self.scan_stdout()?;
                if self.exit.is_none() {
                    self.stdout.compact();
                }
            }
            OutputChunk::Stderr(bytes) if self.stderr_end.is_none() => {
                self.stderr.push(bytes);
                if let Some(pos) = self.stderr.find(&self.needle) {
                    // Terminator needs its trailing newline
                    if self.stderr.data.len() > pos + self.needle.len() {
                        self.stderr_end = Some(pos);
                    } else {
                        self.stderr.scanned = pos;
                    }
                }
                if self.stderr_end.is_none() {
                    self.stderr.compact();
                }
            }
            // Stray output after a terminator belongs to background processes
            _ => {}
        }
        Ok(())
    }

    fn scan_stdout(&mut self) -> Result<(), SandboxError> {
        let Some(pos) = self.stdout.find(&self.needle) else {
            return Ok(());
        };
        let tail = &self.stdout.data[pos + self.needle.len()..];
        let Some(newline) = tail.iter().position(|b| *b == b'\n') else {
            // Exit code not fully received yet
            self.stdout.scanned = pos;
            return Ok(());
        };
        let code = std::str::from_utf8(&tail[..newline])
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .ok_or_else(|| {
                SandboxError::Container("Malformed interpreter reply terminator".to_string())
            })?;
        self.exit = Some((pos, code));
        Ok(())
    }

    /// Both terminators seen
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.exit.is_some() && self.stderr_end.is_some()
    }

    /// Final reply, once complete
    #[must_use]
    pub fn finish(&self) -> Option<RawReply> {
        let (stdout_end, exit_code) = self.exit?;
        let stderr_end = self.stderr_end?;
        let (stdout, cut_out) = self.stdout.content(stdout_end);
        let (stderr, cut_err) = self.stderr.content(stderr_end);
        Some(RawReply {
            stdout,
            stderr,
            exit_code,
            truncated: cut_out || cut_err,
        })
    }
}

/// The long-lived interpreter process of one kernel
#[derive(Debug)]
pub struct InterpreterSession {
    exec: ExecSession,
    marker: String,
    max_output_bytes: usize,
}

impl InterpreterSession {
    /// Start the language driver inside `container`
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Container` if the exec cannot be started.
    #[instrument(skip(runtime), fields(container_id = %container.id))]
    pub async fn open(
        runtime: &dyn ContainerRuntime,
        container: &ContainerRef,
        language: Language,
        max_output_bytes: usize,
    ) -> Result<Self, SandboxError> {
        let marker = new_marker();
        let exec = runtime
            .exec_attached(container, language.driver_command(&marker))
            .await?;
        debug!("Interpreter session opened");
        Ok(Self {
            exec,
            marker,
            max_output_bytes,
        })
    }

    /// Send one snippet and wait for its complete reply.
    ///
    /// Not cancellation-safe: a dropped call leaves the stream mid-reply, so
    /// the session must be discarded afterwards.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Container` if stdin is closed or the output
    /// stream ends before the reply completes (the interpreter died).
    pub async fn run(&mut self, code: &str) -> Result<RawReply, SandboxError> {
        let line = encode_request(code);
        self.exec.input.write_all(line.as_bytes()).await?;
        self.exec.input.flush().await?;

        let mut collector = ReplyCollector::new(&self.marker, self.max_output_bytes);
        while !collector.is_complete() {
            match self.exec.output.next().await {
                Some(chunk) => collector.push(&chunk?)?,
                None => {
                    return Err(SandboxError::Container(
                        "Interpreter exited unexpectedly".to_string(),
                    ))
                }
            }
        }

        collector.finish().ok_or_else(|| {
            SandboxError::Container("Interpreter reply incomplete".to_string())
        })
    }
}
