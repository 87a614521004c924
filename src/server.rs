//! Shared server state and the life of one connection.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::access::{self, AuthOutcome};
use crate::cgi::CgiRequest;
use crate::config::{Config, ParseMode};
use crate::encode::{ClfDate, LogEncoded};
use crate::mime::MimeMap;
use crate::request::{read_request, Incoming, ReadTimeout};
use crate::response::{
    error_reply_with_info, redirect_reply, Decision, Dispatcher, OpenFile, Status,
};

pub const DEFAULT_REALM: &str = "Web Server Authentication";
/// How long to keep reading from a client after our reply, so it sees the reply rather than a
/// reset.
const LINGER: Duration = Duration::from_secs(2);

/// Where to put the access log.
#[derive(Debug)]
pub enum LogSink {
    Stdout,
    Syslog,
    File(BufWriter<File>),
    Off,
}

impl LogSink {
    fn log(&mut self, message: &str) -> io::Result<()> {
        match self {
            Self::Stdout => {
                let mut stdout = io::stdout().lock();
                write!(stdout, "{}", message)?;
                stdout.flush()?;
            }
            Self::Syslog => {
                let message = CString::new(message.trim_end())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                unsafe {
                    libc::syslog(
                        libc::LOG_INFO,
                        b"%s\0".as_ptr() as *const libc::c_char,
                        message.as_ptr(),
                    )
                };
            }
            Self::File(file) => {
                write!(file, "{}", message)?;
                file.flush()?;
            }
            Self::Off => {}
        }
        Ok(())
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::Stdout
    }
}

/// Settings fixed at startup.
#[derive(Debug)]
pub struct Settings {
    /// Document root, canonical.
    pub root: PathBuf,
    /// Config file given on the command line, if any.
    pub config_path: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub realm: String,
    /// Port we listen on, for `SERVER_PORT`.
    pub port: u16,
}

/// What the access log needs to know about a connection.
#[derive(Debug, Default)]
struct LogRecord {
    request_line: Option<String>,
    user: Option<String>,
    status: u16,
    bytes_sent: u64,
    referer: Option<String>,
}

impl LogRecord {
    fn reply(&mut self, status: Status, bytes_sent: u64) {
        self.status = status.code();
        self.bytes_sent = bytes_sent;
    }

    /// Common Log Format line, or `None` if there is no request to speak of.
    fn format(&self, client: IpAddr, now: SystemTime) -> Option<String> {
        let request_line = self.request_line.as_deref()?;
        if self.status == 0 {
            return None;
        }
        Some(format!(
            "{} - {} {} \"{}\" {} {} \"{}\"\n",
            client,
            LogEncoded(self.user.as_deref().unwrap_or("-")),
            ClfDate(now),
            LogEncoded(request_line),
            self.status,
            self.bytes_sent,
            LogEncoded(self.referer.as_deref().unwrap_or("")),
        ))
    }
}

#[derive(Debug)]
pub struct Server {
    settings: Settings,
    /// Replaced wholesale on reload. Connections keep the snapshot they started with.
    config: RwLock<Arc<Config>>,
    mime_map: MimeMap,
    log_sink: Mutex<LogSink>,
}

impl Server {
    pub fn new(settings: Settings, config: Config, log_sink: LogSink) -> Self {
        Self {
            settings,
            config: RwLock::new(Arc::new(config)),
            mime_map: MimeMap::default(),
            log_sink: Mutex::new(log_sink),
        }
    }

    /// The current config.
    pub fn config(&self) -> Arc<Config> {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&config)
    }

    /// Re-read the config files. On failure the old config stays in effect.
    pub fn reload(&self) -> Result<()> {
        let config = Config::load(
            self.settings.config_path.as_deref(),
            &self.settings.root,
            ParseMode::Reload,
        )?;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
        info!("configuration reloaded");
        Ok(())
    }

    /// Serve one request on `stream` and close it.
    pub fn handle_connection(&self, stream: TcpStream, remote: SocketAddr) {
        let mut writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(e) => {
                warn!(%remote, error = %e, "failed to clone connection");
                return;
            }
        };
        let mut incoming = Incoming::new(stream, self.settings.timeout);
        let mut record = LogRecord::default();
        if let Err(e) = self.serve(&mut incoming, &mut writer, remote, &mut record) {
            debug!(%remote, error = %e, "connection failed");
        }
        self.log_connection(&record, remote.ip());
        close_gracefully(&writer);
    }

    fn serve<S, W>(
        &self,
        incoming: &mut Incoming<S>,
        out: &mut W,
        remote: SocketAddr,
        record: &mut LogRecord,
    ) -> io::Result<()>
    where
        S: Read + ReadTimeout + Send,
        W: Write,
    {
        let line = match incoming.read_line() {
            Ok(Some(line)) if !line.is_empty() => line,
            Ok(_) => return Ok(()),
            Err(e) => {
                debug!(%remote, error = %e, "no request line");
                return match e.status() {
                    Some(status) => self.send_error(out, status, record),
                    None => Ok(()),
                };
            }
        };
        record.request_line = Some(line.clone());

        let request = match read_request(&line, incoming) {
            Ok(request) => request,
            Err(e) => {
                debug!(%remote, error = %e, "bad request");
                return match e.status() {
                    Some(status) => self.send_error_with_info(out, status, e.detail(), record),
                    None => Ok(()),
                };
            }
        };
        record.referer = request.headers.referer.clone();

        let now = SystemTime::now();
        let config = self.config();
        let (config, ip_allowed) =
            access::scope_for_request(&config, &self.settings.root, &request.path, remote.ip());
        let auth = access::check_auth(
            &config,
            &request.path,
            request.headers.credentials.as_deref(),
        );
        if let AuthOutcome::Authorized { user } = &auth {
            record.user = Some(user.clone());
        }
        let dispatcher = Dispatcher {
            root: &self.settings.root,
            config: &config,
            mime_map: &self.mime_map,
        };

        match dispatcher.decide(&request, ip_allowed, &auth) {
            Decision::ServeFile { path, mime } => match OpenFile::open(&path) {
                Some(mut file) => {
                    // logged as 200 even if the client goes away mid-file
                    record.reply(Status::Ok, 0);
                    let headers = file.headers(&mime, now);
                    out.write_all(headers.as_bytes())?;
                    record.bytes_sent += headers.len() as u64;
                    record.bytes_sent += file.send(out)?;
                }
                None => self.send_error(out, Status::NotFound, record)?,
            },
            Decision::Redirect(location) => {
                let reply = redirect_reply(&location, now);
                out.write_all(reply.as_bytes())?;
                record.reply(Status::Found, reply.len() as u64);
            }
            Decision::Error(status) => self.send_error(out, status, record)?,
            Decision::RunCgi { path } => {
                let cgi = CgiRequest {
                    root: &self.settings.root,
                    config: &config,
                    request: &request,
                    path: &path,
                    remote,
                    server_port: self.settings.port,
                    remote_user: record.user.as_deref(),
                };
                match cgi.run(incoming, out) {
                    Ok(outcome) => {
                        record.status = outcome.status;
                        record.bytes_sent = outcome.bytes_sent;
                    }
                    Err(e) => {
                        warn!(%remote, path = %path, error = %e, "CGI failed");
                        self.send_error(out, e.status(), record)?;
                    }
                }
            }
        }
        out.flush()
    }

    fn send_error<W: Write>(
        &self,
        out: &mut W,
        status: Status,
        record: &mut LogRecord,
    ) -> io::Result<()> {
        self.send_error_with_info(out, status, None, record)
    }

    fn send_error_with_info<W: Write>(
        &self,
        out: &mut W,
        status: Status,
        info: Option<&str>,
        record: &mut LogRecord,
    ) -> io::Result<()> {
        let reply = error_reply_with_info(status, info, &self.settings.realm, SystemTime::now());
        out.write_all(reply.as_bytes())?;
        record.reply(status, reply.len() as u64);
        Ok(())
    }

    /// Add a connection's details to the access log.
    fn log_connection(&self, record: &LogRecord, client: IpAddr) {
        let message = match record.format(client, SystemTime::now()) {
            Some(message) => message,
            None => return,
        };
        let mut log_sink = self.log_sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = log_sink.log(&message) {
            warn!(error = %e, "failed to write access log");
        }
    }
}

/// Stop sending, then read whatever the client still sends for a while before closing.
fn close_gracefully(stream: &TcpStream) {
    if stream.shutdown(Shutdown::Write).is_err() {
        return;
    }
    if stream.set_read_timeout(Some(LINGER)).is_err() {
        return;
    }
    let deadline = Instant::now() + LINGER;
    let mut reader = stream;
    let mut buf = [0; 1024];
    while Instant::now() < deadline {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}
