use std::fs::{canonicalize, OpenOptions};
use std::io::BufWriter;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::time::{TimeVal, TimeValLike};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{
    chdir, close, dup2, fork, pipe, read, setgid, setgroups, setsid, setuid, ForkResult, Gid,
    Group, Uid, User,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use httpd_rs::config::{Config, ParseMode};
use httpd_rs::crypt::hash_password;
use httpd_rs::encode::{url_decode, DecodeMode, HtmlEncoded};
use httpd_rs::server::{LogSink, Server, Settings, DEFAULT_REALM};

const PATH_DEVNULL: &str = "/dev/null";

static RUNNING: AtomicBool = AtomicBool::new(true);
static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

extern "C" fn request_reload(_signal: libc::c_int) {
    RELOAD.store(true, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

/// Small HTTP server with CGI, per-directory access rules and Basic authentication.
#[derive(Debug, Parser)]
#[command(version, disable_help_flag = true)]
struct Args {
    /// Config file (default: /etc/httpd.conf, then HOME/httpd.conf)
    #[arg(short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,
    /// Document root
    #[arg(short = 'h', value_name = "HOME", default_value = ".")]
    home: PathBuf,
    /// Address to listen on
    #[arg(short = 'p', value_name = "[IP:]PORT", default_value = "80")]
    port: String,
    /// Drop privileges to this user after binding
    #[arg(short = 'u', value_name = "USER[:GROUP]")]
    user: Option<String>,
    /// Authentication realm
    #[arg(short = 'r', value_name = "REALM", default_value = DEFAULT_REALM)]
    realm: String,
    /// Stay in the foreground
    #[arg(short = 'f')]
    foreground: bool,
    /// Request timeout in seconds, 0 to wait forever
    #[arg(short = 't', value_name = "SECS", default_value_t = 60)]
    timeout: u64,
    /// Append the access log to FILE instead of stdout
    #[arg(short = 'l', value_name = "FILE", conflicts_with_all = ["syslog", "quiet"])]
    log_file: Option<PathBuf>,
    /// Send the access log to syslog
    #[arg(short = 'S', conflicts_with = "quiet")]
    syslog: bool,
    /// No access log
    #[arg(short = 'q')]
    quiet: bool,
    /// URL-decode STRING and exit
    #[arg(short = 'd', value_name = "STRING")]
    decode: Option<String>,
    /// HTML-encode STRING and exit
    #[arg(short = 'e', value_name = "STRING")]
    encode: Option<String>,
    /// Print an MD5-crypt hash of PASS and exit
    #[arg(short = 'm', value_name = "PASS")]
    md5: Option<String>,
    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

impl Args {
    fn listen_addr(&self) -> Result<SocketAddr> {
        if let Ok(addr) = self.port.parse::<SocketAddr>() {
            return Ok(addr);
        }
        let port = self
            .port
            .parse::<u16>()
            .with_context(|| format!("port {} is invalid", self.port))?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    }

    fn log_sink(&self) -> Result<LogSink> {
        Ok(if let Some(filename) = &self.log_file {
            LogSink::File(BufWriter::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(filename)
                    .with_context(|| {
                        format!("failed to open log file {}", filename.display())
                    })?,
            ))
        } else if self.syslog {
            LogSink::Syslog
        } else if self.quiet {
            LogSink::Off
        } else {
            LogSink::Stdout
        })
    }

    /// Look up the user and group to run as.
    fn drop_ids(&self) -> Result<Option<(Uid, Gid)>> {
        let spec = match &self.user {
            Some(spec) => spec,
            None => return Ok(None),
        };
        let (user, group) = match spec.split_once(':') {
            Some((user, group)) => (user, Some(group)),
            None => (spec.as_str(), None),
        };
        let user = lookup_user(user)?;
        let gid = match group {
            Some(group) => lookup_group(group)?.gid,
            None => user.gid,
        };
        Ok(Some((user.uid, gid)))
    }
}

fn lookup_user(name: &str) -> Result<User> {
    let user1 = User::from_name(name).context("getpwnam failed")?;
    let user2 = name
        .parse()
        .ok()
        .and_then(|uid| User::from_uid(Uid::from_raw(uid)).transpose())
        .transpose()
        .context("getpwuid failed")?;
    user1
        .or(user2)
        .with_context(|| format!("no such user: `{}'", name))
}

fn lookup_group(name: &str) -> Result<Group> {
    let group1 = Group::from_name(name).context("getgrnam failed")?;
    let group2 = name
        .parse()
        .ok()
        .and_then(|gid| Group::from_gid(Gid::from_raw(gid)).transpose())
        .transpose()
        .context("getgrgid failed")?;
    group1
        .or(group2)
        .with_context(|| format!("no such group: `{}'", name))
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("httpd_rs=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // one-shot helpers
    if let Some(url) = &args.decode {
        println!("{}", url_decode(url, DecodeMode::Form)?);
        return Ok(());
    }
    if let Some(text) = &args.encode {
        println!("{}", HtmlEncoded(text));
        return Ok(());
    }
    if let Some(password) = &args.md5 {
        println!("{}", hash_password(password));
        return Ok(());
    }

    let root = canonicalize(&args.home)
        .with_context(|| format!("failed to resolve home directory {}", args.home.display()))?;
    chdir(root.as_path())
        .with_context(|| format!("failed to change working directory to {}", root.display()))?;

    let log_sink = args.log_sink()?;
    let drop_ids = args.drop_ids()?;

    let socket_addr = args.listen_addr()?;
    // Sets `SO_REUSEADDR` implicitly.
    let listener = TcpListener::bind(socket_addr)
        .with_context(|| format!("failed to create listening socket for {}", socket_addr))?;
    let port = listener
        .local_addr()
        .context("failed to get listening address")?
        .port();
    info!("listening on: http://{}/", socket_addr);

    let daemonize = (!args.foreground)
        .then(|| Daemonize::start().context("failed to daemonize"))
        .transpose()?;

    if let Some((uid, gid)) = drop_ids {
        setgroups(&[gid])
            .with_context(|| format!("failed to set supplementary group IDs to [{}]", gid))?;
        setgid(gid).with_context(|| format!("failed to set group ID to {}", gid))?;
        setuid(uid).with_context(|| format!("failed to set user ID to {}", uid))?;
        info!(%uid, %gid, "dropped privileges");
    }

    let config = Config::load(args.config.as_deref(), &root, ParseMode::First)?;
    let settings = Settings {
        root,
        config_path: args.config.clone(),
        timeout: match args.timeout {
            0 => None,
            timeout_secs => Some(Duration::from_secs(timeout_secs)),
        },
        realm: args.realm.clone(),
        port,
    };
    let server = Arc::new(Server::new(settings, config, log_sink));

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;
    unsafe { signal(Signal::SIGHUP, SigHandler::Handler(request_reload)) }
        .context("failed to set SIGHUP handler")?;

    daemonize
        .map(|daemonize| daemonize.finish().context("failed to daemonize"))
        .transpose()?;

    while is_running() {
        httpd_poll(&server, &listener)?;
    }
    info!("shutting down");
    Ok(())
}

/// Wait for a connection and hand it to its own thread. Returns early when interrupted, so the
/// caller can look at the signal flags.
fn httpd_poll(server: &Arc<Server>, listener: &TcpListener) -> Result<()> {
    if RELOAD.swap(false, Ordering::Relaxed) {
        if let Err(e) = server.reload() {
            error!("failed to reload configuration, keeping the old one: {:#}", e);
        }
    }

    let mut recv_set = FdSet::new();
    recv_set.insert(listener.as_raw_fd());
    // Signals may land on a connection thread, so don't sleep forever.
    let mut timeout = TimeVal::seconds(1);
    match select(None, Some(&mut recv_set), None, None, Some(&mut timeout)) {
        Ok(0) | Err(Errno::EINTR) => return Ok(()),
        Ok(_) => {}
        Err(e) => return Err(e).context("select() failed"),
    }

    let (stream, remote) = match listener.accept() {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!(error = %e, "accept() failed");
            return Ok(());
        }
    };
    let server = Arc::clone(server);
    if let Err(e) = thread::Builder::new()
        .name(format!("conn-{}", remote))
        .spawn(move || server.handle_connection(stream, remote))
    {
        warn!(%remote, error = %e, "failed to spawn connection thread");
    }
    Ok(())
}

struct Daemonize {
    lifeline_read: RawFd,
    lifeline_write: RawFd,
    fd_null: RawFd,
}

impl Daemonize {
    fn start() -> Result<Self> {
        // create lifeline pipe
        let (lifeline_read, lifeline_write) = pipe().context("failed to create pipe")?;

        // populate fd_null
        let fd_null = OpenOptions::new()
            .read(true)
            .write(true)
            .open(PATH_DEVNULL)
            .with_context(|| format!("failed to open {}", PATH_DEVNULL))?
            .into_raw_fd();

        if let ForkResult::Parent { child } = unsafe { fork() }.context("failed to fork process")? {
            // wait for the child
            if let Err(e) = close(lifeline_write) {
                warn!(error = %e, "failed to close lifeline in parent");
            }
            let mut buf = [0; 1];
            if let Err(e) = read(lifeline_read, &mut buf) {
                warn!(error = %e, "failed to read lifeline in parent");
            }
            // exit with status depending on child status
            match waitpid(child, Some(WaitPidFlag::WNOHANG))
                .with_context(|| format!("failed to wait for process {}", child))?
            {
                WaitStatus::StillAlive => std::process::exit(0),
                WaitStatus::Exited(_, status) => std::process::exit(status),
                _ => return Err(anyhow!("waitpid returned unknown status")),
            }
        }
        Ok(Self {
            lifeline_read,
            lifeline_write,
            fd_null,
        })
    }

    fn finish(self) -> Result<()> {
        setsid().context("failed to create session")?;
        if let Err(e) = close(self.lifeline_read) {
            warn!(error = %e, "failed to close read end of lifeline in child");
        }
        if let Err(e) = close(self.lifeline_write) {
            warn!(error = %e, "failed to cut the lifeline");
        }

        // close all our std fds
        for (fd, name) in [
            (libc::STDIN_FILENO, "stdin"),
            (libc::STDOUT_FILENO, "stdout"),
            (libc::STDERR_FILENO, "stderr"),
        ] {
            if let Err(e) = dup2(self.fd_null, fd) {
                warn!(error = %e, "failed to close {}", name);
            }
        }
        if self.fd_null > 2 {
            close(self.fd_null).ok();
        }
        Ok(())
    }
}
