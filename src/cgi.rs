//! Running CGI scripts under `/cgi-bin/`.
//!
//! The script runs as a child process with a cleared environment holding the CGI variables.
//! Its stdout and stderr share one pipe. While a scoped thread writes the request body to the
//! script's stdin, a drainer thread reads its output into a bounded channel and the
//! connection thread relays those chunks to the client. A script that stops reading stdin
//! or a client that stops reading output holds everything up at a pipe or channel of fixed
//! size.

use std::fs::{canonicalize, File};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::FromRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::request::Request;
use crate::response::Status;

const PIPE_CHUNK: usize = 4096;
/// Chunks of script output held while the client is slow to take them.
const OUTPUT_QUEUE: usize = 8;
/// How often the relay checks whether the script has exited while it is quiet.
const RELAY_POLL: Duration = Duration::from_millis(500);
const DEFAULT_STATUS_LINE: &[u8] = b"HTTP/1.0 200 OK\r\n";
const DEFAULT_CONTENT_TYPE: &[u8] = b"Content-type: text/plain\r\n\r\n";

pub const SERVER_SOFTWARE: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum CgiError {
    #[error("script not found: {0}")]
    NotFound(String),
    #[error("failed to start script: {0}")]
    Spawn(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CgiError {
    /// Status to answer with, if nothing has been sent yet.
    pub fn status(&self) -> Status {
        match self {
            Self::NotFound(_) => Status::NotFound,
            Self::Spawn(_) | Self::Io(_) => Status::InternalServerError,
        }
    }
}

/// Everything a script gets to know about the request it serves.
pub struct CgiRequest<'a> {
    pub root: &'a Path,
    pub config: &'a Config,
    pub request: &'a Request,
    /// Normalized request path, starting with the CGI prefix.
    pub path: &'a str,
    pub remote: SocketAddr,
    pub server_port: u16,
    /// Set when Basic auth succeeded.
    pub remote_user: Option<&'a str>,
}

/// What the relay sent back to the client.
#[derive(Debug, PartialEq, Eq)]
pub struct CgiOutcome {
    /// Status from the script's status line, or 200 if it sent none.
    pub status: u16,
    pub bytes_sent: u64,
}

/// Split `path` into the script name and the trailing `PATH_INFO`. The script is the first
/// prefix (ending before a `/`) that is not a directory under `root`.
pub fn split_path_info<'p>(root: &Path, path: &'p str) -> (&'p str, &'p str) {
    for (index, _) in path.match_indices('/').filter(|&(index, _)| index > 0) {
        if !root.join(&path[1..index]).is_dir() {
            return path.split_at(index);
        }
    }
    (path, "")
}

/// Interpreter configured for the suffix of `script`, if any.
pub fn interpreter_for<'c>(config: &'c Config, script: &str) -> Option<&'c str> {
    let suffix = &script[script.rfind('.')?..];
    config
        .interpreters
        .iter()
        .find(|rule| rule.suffix == suffix)
        .map(|rule| rule.value.as_str())
}

impl<'a> CgiRequest<'a> {
    /// Environment for the script, `PATH` excluded.
    pub fn environment(
        &self,
        script_name: &str,
        script_file: &Path,
        path_info: &str,
    ) -> Vec<(String, String)> {
        let request = self.request;
        let query = request.query.as_deref().unwrap_or("");
        let request_uri = match &request.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.to_string(),
        };
        let mut env = vec![
            ("PATH_INFO".to_string(), path_info.to_string()),
            ("REQUEST_METHOD".to_string(), request.method.as_str().to_string()),
            ("REQUEST_URI".to_string(), request_uri),
            ("SCRIPT_NAME".to_string(), script_name.to_string()),
            ("SCRIPT_FILENAME".to_string(), script_file.to_string_lossy().into_owned()),
            ("QUERY_STRING".to_string(), query.to_string()),
            ("SERVER_SOFTWARE".to_string(), SERVER_SOFTWARE.to_string()),
            ("SERVER_PROTOCOL".to_string(), "HTTP/1.0".to_string()),
            ("SERVER_PORT".to_string(), self.server_port.to_string()),
            ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
            ("REMOTE_ADDR".to_string(), self.remote.ip().to_string()),
            ("REMOTE_PORT".to_string(), self.remote.port().to_string()),
        ];
        let headers = &request.headers;
        if headers.content_length > 0 {
            env.push(("CONTENT_LENGTH".to_string(), headers.content_length.to_string()));
        }
        if let Some(content_type) = &headers.content_type {
            env.push(("CONTENT_TYPE".to_string(), content_type.clone()));
        }
        if let Some(cookie) = &headers.cookie {
            env.push(("HTTP_COOKIE".to_string(), cookie.clone()));
        }
        if let Some(referer) = &headers.referer {
            env.push(("HTTP_REFERER".to_string(), referer.clone()));
        }
        if let Some(user) = self.remote_user {
            env.push(("REMOTE_USER".to_string(), user.to_string()));
            env.push(("AUTH_TYPE".to_string(), "Basic".to_string()));
        }
        env
    }

    /// Start the script. Its stdout and stderr both end up in the returned reader.
    fn spawn(&self) -> Result<(Child, File), CgiError> {
        let (script_name, path_info) = split_path_info(self.root, self.path);
        let script_file: PathBuf = canonicalize(self.root.join(script_name.trim_start_matches('/')))
            .map_err(|_| CgiError::NotFound(script_name.to_string()))?;
        let dir = script_file
            .parent()
            .ok_or_else(|| CgiError::NotFound(script_name.to_string()))?;
        let name = script_name.rsplit('/').next().unwrap_or(script_name);

        let (output_read, output_write) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        // Both ends are fresh descriptors that nothing else owns.
        let (output_read, output_write) =
            unsafe { (File::from_raw_fd(output_read), File::from_raw_fd(output_write)) };

        let mut command = match interpreter_for(self.config, script_name) {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(&script_file);
                command
            }
            None => {
                let mut command = Command::new(&script_file);
                command.arg0(name);
                command
            }
        };
        command
            .env_clear()
            .envs(self.environment(script_name, &script_file, path_info))
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(output_write.try_clone()?))
            .stderr(Stdio::from(output_write));
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        let child = command.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                debug!(script = %script_file.display(), error = %e, "cannot execute script");
                CgiError::NotFound(script_name.to_string())
            }
            _ => CgiError::Spawn(e),
        })?;
        // Drop our copies of the write end so the drainer sees end of file when the
        // script exits.
        drop(command);
        Ok((child, output_read))
    }

    /// Run the script: forward `content_length` bytes of request body from `body` and relay
    /// its output to `client`. Both happen at once, so a script may answer before the body
    /// is in.
    ///
    /// Returns an error only if nothing was sent to the client yet.
    pub fn run<R: Read + Send, W: Write>(
        &self,
        body: &mut R,
        client: &mut W,
    ) -> Result<CgiOutcome, CgiError> {
        let (mut child, output) = self.spawn()?;
        let stdin = child.stdin.take();
        let length = self.request.headers.content_length;

        let (output_tx, output_rx) = mpsc::sync_channel::<Vec<u8>>(OUTPUT_QUEUE);
        thread::spawn(move || drain(output, &output_tx));

        let outcome = thread::scope(|scope| {
            scope.spawn(move || {
                if let Some(mut stdin) = stdin {
                    forward_body(body, length, &mut stdin);
                }
            });
            let outcome = relay(&mut child, &output_rx, client);
            if outcome.is_err() {
                // unblocks the body writer too
                child.kill().ok();
            }
            outcome
        });
        match child.wait() {
            Ok(status) => debug!(path = self.path, %status, "script finished"),
            Err(e) => warn!(path = self.path, error = %e, "failed to wait for script"),
        }
        Ok(outcome.unwrap_or_else(|sent| CgiOutcome {
            status: 200,
            bytes_sent: sent,
        }))
    }
}

/// Write up to `length` bytes of request body to the script's stdin. Stops early if the
/// client goes quiet or away, or the script closes its stdin.
fn forward_body<R: Read, S: Write>(body: &mut R, length: u64, stdin: &mut S) {
    let mut remaining = length;
    let mut buf = [0; PIPE_CHUNK];
    while remaining > 0 {
        let want = remaining.min(PIPE_CHUNK as u64) as usize;
        let count = match body.read(&mut buf[..want]) {
            Ok(0) => break,
            Ok(count) => count,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "stopped reading request body");
                break;
            }
        };
        remaining -= count as u64;
        if let Err(e) = stdin.write_all(&buf[..count]) {
            debug!(error = %e, remaining, "script stopped taking request body");
            break;
        }
    }
}

/// Read script output into `output_tx` until the pipe closes or the relay goes away.
fn drain(mut output: File, output_tx: &mpsc::SyncSender<Vec<u8>>) {
    let mut buf = [0; PIPE_CHUNK];
    loop {
        match output.read(&mut buf) {
            Ok(0) => break,
            Ok(count) => {
                if output_tx.send(buf[..count].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
}

/// Copy script output to the client until the output pipe closes, or the script has exited
/// and stayed quiet. On a client write error, returns the bytes sent so far as the error.
fn relay<W: Write>(
    child: &mut Child,
    output_rx: &mpsc::Receiver<Vec<u8>>,
    client: &mut W,
) -> Result<CgiOutcome, u64> {
    let mut outcome = CgiOutcome {
        status: 200,
        bytes_sent: 0,
    };
    let mut first_chunk = true;
    let mut exited = false;
    loop {
        let chunk = match output_rx.recv_timeout(RELAY_POLL) {
            Ok(chunk) => chunk,
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if exited {
                    // something the script started still holds the pipe open
                    break;
                }
                exited = !matches!(child.try_wait(), Ok(None));
                continue;
            }
        };
        if first_chunk {
            first_chunk = false;
            let prefix = header_fixup(&chunk);
            outcome.status = script_status(&chunk).unwrap_or(200);
            if client.write_all(&prefix).is_err() {
                return Err(outcome.bytes_sent);
            }
            outcome.bytes_sent += prefix.len() as u64;
        }
        if client.write_all(&chunk).is_err() {
            return Err(outcome.bytes_sent);
        }
        outcome.bytes_sent += chunk.len() as u64;
    }
    client.flush().map_err(|_| outcome.bytes_sent)?;
    Ok(outcome)
}

/// Headers to send ahead of the first chunk of script output: a status line if the script
/// did not start with one, and a plain text content type if it mentioned none.
pub fn header_fixup(first_chunk: &[u8]) -> Vec<u8> {
    let mut prefix = Vec::new();
    if !first_chunk.starts_with(b"HTTP") {
        prefix.extend_from_slice(DEFAULT_STATUS_LINE);
    }
    if !first_chunk.windows(7).any(|window| window == b"ontent-") {
        prefix.extend_from_slice(DEFAULT_CONTENT_TYPE);
    }
    prefix
}

/// Status code from an `HTTP/x.y NNN ...` line at the start of script output.
fn script_status(first_chunk: &[u8]) -> Option<u16> {
    let line = first_chunk.split(|&b| b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?;
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}
