#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{create_dir_all, set_permissions, write, Permissions};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::{tempdir, TempDir};

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("127.0.0.1", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

pub struct Server {
    child: ScopedChild,
    port: u16,
    root: TempDir,
}

impl Server {
    /// Start a server in the foreground with `config` as its config file.
    pub fn with_config(config: &str, args: &[&str]) -> Self {
        let root = tempdir().expect("failed to create tempdir");
        let config_path = root.path().join("httpd.conf");
        write(&config_path, config).expect("failed to write config");

        // Assumes the port won't be reused before the server binds it.
        let port = get_unused_port().expect("failed to get unused port");

        let child = Command::new(env!("CARGO_BIN_EXE_httpd-rs"))
            .arg("-f")
            .arg("-q")
            .arg("-p")
            .arg(format!("127.0.0.1:{}", port))
            .arg("-h")
            .arg(root.path())
            .arg("-c")
            .arg(&config_path)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn server");
        let child = ScopedChild(child);

        assert!(wait_for_port(port), "failed to connect to server");

        Self { child, port, root }
    }

    pub fn new() -> Self {
        Self::with_config("", &[])
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn create_dir(&self, name: &str) {
        create_dir_all(self.root().join(name)).expect("failed to create directory");
    }

    pub fn create_file(&self, name: &str, contents: &str) {
        write(self.root().join(name), contents).expect("failed to create file");
    }

    pub fn create_executable(&self, name: &str, contents: &str) {
        self.create_file(name, contents);
        set_permissions(self.root().join(name), Permissions::from_mode(0o755))
            .expect("failed to make file executable");
    }

    pub fn signal(&self, signal: Signal) {
        kill(Pid::from_raw(self.child.0.id() as i32), signal).expect("failed to signal server");
    }

    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to server");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Send `raw` as is and read the reply until the server closes the connection.
    pub fn send(&self, raw: &str) -> Response {
        let mut stream = self.stream();
        stream.write_all(raw.as_bytes()).unwrap();
        Response::from_reader(&mut stream)
    }

    pub fn get(&self, path: &str) -> Response {
        self.send(&format!("GET {} HTTP/1.0\r\n\r\n", path))
    }

    pub fn get_with(&self, path: &str, headers: &[(&str, &str)]) -> Response {
        let mut raw = format!("GET {} HTTP/1.0\r\n", path);
        for (name, value) in headers {
            raw.push_str(&format!("{}: {}\r\n", name, value));
        }
        raw.push_str("\r\n");
        self.send(&raw)
    }
}

/// HTTP response from the server.
#[derive(Debug)]
pub struct Response {
    status_line: String,
    /// Keyed by lowercased name.
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> Self {
        let mut raw = Vec::new();
        reader
            .read_to_end(&mut raw)
            .expect("failed to read response");
        Self::parse(&raw)
    }

    pub fn parse(raw: &[u8]) -> Self {
        let split = raw
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .unwrap_or_else(|| panic!("no end of headers in {:?}", String::from_utf8_lossy(raw)));
        let head = std::str::from_utf8(&raw[..split]).expect("headers are not valid UTF-8");
        let mut lines = head.split("\r\n");
        let status_line = lines.next().expect("no status line").to_string();
        let headers = lines
            .map(|line| {
                let (name, value) = line.split_once(':').expect("invalid header");
                (name.to_ascii_lowercase(), value.trim().to_string())
            })
            .collect();
        Self {
            status_line,
            headers,
            body: raw[split + 4..].to_vec(),
        }
    }

    /// Status code and reason, e.g. `404 Not Found`.
    pub fn status(&self) -> &str {
        self.status_line
            .split_once(' ')
            .map(|(_, status)| status)
            .expect("invalid status line")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).expect("body is not valid UTF-8")
    }
}
