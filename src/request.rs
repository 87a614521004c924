//! Reading and validating the request line and headers.
//!
//! A connection moves from waiting for the request line to waiting for headers and ends up
//! either with a [`Request`] or with a [`RequestError`]: a timeout, or a bad request of some
//! kind.

use std::io::{self, BufRead, BufReader, Read};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

use crate::encode::{url_decode, DecodeError, DecodeMode};
use crate::response::Status;

/// Longest request or header line kept. Anything past this is dropped.
pub const MAX_LINE_LENGTH: usize = 8192;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("timed out waiting for the request")]
    Timeout,
    #[error("malformed request line")]
    BadRequestLine,
    #[error("unsupported method `{0}'")]
    UnsupportedMethod(String),
    #[error("bad URL: {0}")]
    BadUrl(#[from] DecodeError),
    #[error("URL ascends above the document root")]
    Traversal,
    #[error("bad Content-Length `{0}'")]
    BadContentLength(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RequestError {
    /// Status to answer with, or `None` if the client is gone and nothing should be sent.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Timeout => Some(Status::RequestTimeout),
            Self::UnsupportedMethod(_) => Some(Status::NotImplemented),
            Self::BadRequestLine
            | Self::BadUrl(_)
            | Self::Traversal
            | Self::BadContentLength(_) => Some(Status::BadRequest),
            Self::Io(_) => None,
        }
    }

    /// Line for the error page when the status alone says too little about what was wrong.
    pub fn detail(&self) -> Option<&'static str> {
        match self {
            Self::BadUrl(_) => Some("Malformed URL encoding."),
            Self::Traversal => Some("URL ascends above the document root."),
            Self::BadContentLength(_) => Some("Invalid Content-length."),
            _ => None,
        }
    }
}

/// Streams whose blocking reads can be bounded.
pub trait ReadTimeout {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl ReadTimeout for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

impl ReadTimeout for &[u8] {
    fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

/// Buffered reading side of a connection. Every line must arrive within `timeout` of the
/// moment we start waiting for it.
pub struct Incoming<S: Read> {
    reader: BufReader<S>,
    timeout: Option<Duration>,
}

impl<S: Read + ReadTimeout> Incoming<S> {
    pub fn new(stream: S, timeout: Option<Duration>) -> Self {
        Self {
            reader: BufReader::new(stream),
            timeout,
        }
    }

    /// Read a line without its `\r\n` or `\n`. Returns `None` at end of stream when nothing
    /// was read. Stray `\r` characters are dropped.
    pub fn read_line(&mut self) -> Result<Option<String>, RequestError> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut line = Vec::new();
        loop {
            if let Some(deadline) = deadline {
                if self.reader.buffer().is_empty() {
                    let remaining = deadline
                        .checked_duration_since(Instant::now())
                        .filter(|remaining| !remaining.is_zero())
                        .ok_or(RequestError::Timeout)?;
                    self.reader.get_ref().set_read_timeout(Some(remaining))?;
                }
            }
            let available = match self.reader.fill_buf() {
                Ok(available) => available,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => return Err(RequestError::Timeout),
                Err(e) => return Err(e.into()),
            };
            if available.is_empty() {
                let line = (!line.is_empty()).then(|| String::from_utf8_lossy(&line).into_owned());
                return Ok(line);
            }
            let (consumed, done) = match available.iter().position(|&b| b == b'\n') {
                Some(index) => (index + 1, true),
                None => (available.len(), false),
            };
            for &b in &available[..consumed] {
                if b != b'\r' && b != b'\n' && line.len() < MAX_LINE_LENGTH {
                    line.push(b);
                }
            }
            self.reader.consume(consumed);
            if done {
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
        }
    }
}

/// Body reads are bounded by the same timeout, applied per read.
impl<S: Read + ReadTimeout> Read for Incoming<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.reader.buffer().is_empty() {
            self.reader.get_ref().set_read_timeout(self.timeout)?;
        }
        self.reader.read(buf)
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    fn parse(method: &str) -> Option<Self> {
        if method.eq_ignore_ascii_case("GET") {
            Some(Self::Get)
        } else if method.eq_ignore_ascii_case("POST") {
            Some(Self::Post)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct RequestLine<'a> {
    pub method: Method,
    /// Raw path as sent, without the query.
    pub path: &'a str,
    pub query: Option<&'a str>,
    /// False for HTTP/0.9 style requests, which have no headers.
    pub has_headers: bool,
}

/// Split `METHOD target [HTTP/x.y]`.
pub fn parse_request_line(line: &str) -> Result<RequestLine<'_>, RequestError> {
    let (method, rest) = line
        .split_once(|c: char| c == ' ' || c == '\t')
        .ok_or(RequestError::BadRequestLine)?;
    let method =
        Method::parse(method).ok_or_else(|| RequestError::UnsupportedMethod(method.to_string()))?;

    let rest = rest.trim_start();
    let (target, version) = match rest.split_once(' ') {
        Some((target, version)) => (target, version.trim_start()),
        None => (rest, ""),
    };
    if !target.starts_with('/') {
        return Err(RequestError::BadRequestLine);
    }
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };
    let has_headers = version
        .strip_prefix("HTTP/")
        .map_or(false, |number| number.starts_with(|c: char| c.is_ascii_digit()));
    Ok(RequestLine {
        method,
        path,
        query,
        has_headers,
    })
}

/// Percent-decode and normalize a request path.
pub fn decode_path(raw: &str) -> Result<String, RequestError> {
    let decoded = url_decode(raw, DecodeMode::Path)?;
    normalize_path(&decoded)
}

/// Resolve `//`, `/./` and `/../` in a path. Ascending above `/` is an error.
pub fn normalize_path(path: &str) -> Result<String, RequestError> {
    let rest = path
        .strip_prefix('/')
        .ok_or(RequestError::BadRequestLine)?;
    let mut segments: Vec<&str> = Vec::new();
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop().ok_or(RequestError::Traversal)?;
            }
            segment => segments.push(segment),
        }
    }
    let mut normalized = format!("/{}", segments.join("/"));
    if path.ends_with('/') && !segments.is_empty() {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Headers we act on. Everything else is ignored.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Headers {
    pub content_length: u64,
    pub cookie: Option<String>,
    pub content_type: Option<String>,
    pub referer: Option<String>,
    /// Decoded Basic credentials, `user:password`.
    pub credentials: Option<String>,
}

/// Case-insensitive `strip_prefix`.
fn strip_field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let head = line.get(..name.len())?;
    head.eq_ignore_ascii_case(name)
        .then(|| line[name.len()..].trim_start())
}

/// Read header lines up to the blank line (or end of stream).
pub fn read_headers<S: Read + ReadTimeout>(
    incoming: &mut Incoming<S>,
    method: Method,
) -> Result<Headers, RequestError> {
    let mut headers = Headers::default();
    while let Some(line) = incoming.read_line()? {
        if line.is_empty() {
            break;
        }
        if let Some(value) = strip_field(&line, "Content-length:") {
            if method == Method::Post {
                headers.content_length = value
                    .trim_end()
                    .parse()
                    .map_err(|_| RequestError::BadContentLength(value.to_string()))?;
            }
        } else if let Some(value) = strip_field(&line, "Cookie:") {
            headers.cookie = Some(value.to_string());
        } else if let Some(value) = strip_field(&line, "Content-Type:") {
            headers.content_type = Some(value.to_string());
        } else if let Some(value) = strip_field(&line, "Referer:") {
            headers.referer = Some(value.to_string());
        } else if let Some(value) = strip_field(&line, "Authorization:") {
            if let Some(encoded) = strip_field(value, "Basic") {
                headers.credentials = decode_basic(encoded);
            }
        }
    }
    Ok(headers)
}

fn decode_basic(encoded: &str) -> Option<String> {
    let decoded = STANDARD.decode(encoded.trim_end()).ok()?;
    String::from_utf8(decoded).ok()
}

/// A parsed request: everything the dispatcher and the CGI runner need.
#[derive(Debug, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Decoded and normalized.
    pub path: String,
    pub query: Option<String>,
    pub headers: Headers,
}

/// Parse `line` as a request line and read the headers that follow it.
pub fn read_request<S: Read + ReadTimeout>(
    line: &str,
    incoming: &mut Incoming<S>,
) -> Result<Request, RequestError> {
    let request_line = parse_request_line(line)?;
    let path = decode_path(request_line.path)?;
    let headers = if request_line.has_headers {
        read_headers(incoming, request_line.method)?
    } else {
        Headers::default()
    };
    Ok(Request {
        method: request_line.method,
        path,
        query: request_line.query.map(str::to_string),
        headers,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    use test_case::test_case;

    fn buffered(data: &[u8]) -> Incoming<&[u8]> {
        Incoming::new(data, Some(Duration::from_secs(1)))
    }

    #[test]
    fn read_line_works() {
        let mut incoming = buffered(b"GET / HTTP/1.0\r\nHost: x\n\r\nbo\rdy");
        assert_eq!(incoming.read_line().unwrap().as_deref(), Some("GET / HTTP/1.0"));
        assert_eq!(incoming.read_line().unwrap().as_deref(), Some("Host: x"));
        assert_eq!(incoming.read_line().unwrap().as_deref(), Some(""));
        assert_eq!(incoming.read_line().unwrap().as_deref(), Some("body"));
        assert_eq!(incoming.read_line().unwrap(), None);
    }

    #[test]
    fn read_line_truncates() {
        let mut data = vec![b'a'; MAX_LINE_LENGTH * 2];
        data.extend(b"\nnext\n");
        let mut incoming = buffered(&data);
        assert_eq!(incoming.read_line().unwrap().unwrap().len(), MAX_LINE_LENGTH);
        assert_eq!(incoming.read_line().unwrap().as_deref(), Some("next"));
    }

    #[test]
    fn read_line_times_out() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"GET / HTTP/1.0\r\nHost").unwrap();
            thread::sleep(Duration::from_millis(500));
            drop(stream);
        });
        let (stream, _) = listener.accept().unwrap();
        let mut incoming = Incoming::new(stream, Some(Duration::from_millis(100)));
        assert_eq!(incoming.read_line().unwrap().as_deref(), Some("GET / HTTP/1.0"));
        assert!(matches!(incoming.read_line(), Err(RequestError::Timeout)));
        client.join().unwrap();
    }

    #[test_case("GET / HTTP/1.0", Method::Get, "/", None, true ; "simple")]
    #[test_case("get /a?b=c HTTP/1.1", Method::Get, "/a", Some("b=c"), true ; "lowercase with query")]
    #[test_case("POST\t/cgi-bin/x  HTTP/1.0", Method::Post, "/cgi-bin/x", None, true ; "tab and spaces")]
    #[test_case("GET /old", Method::Get, "/old", None, false ; "http 0.9")]
    #[test_case("GET /x?", Method::Get, "/x", Some(""), false ; "empty query")]
    fn parse_request_line_works(
        line: &str,
        method: Method,
        path: &str,
        query: Option<&str>,
        has_headers: bool,
    ) {
        assert_eq!(
            parse_request_line(line).unwrap(),
            RequestLine {
                method,
                path,
                query,
                has_headers
            }
        );
    }

    #[test]
    fn parse_request_line_rejects() {
        assert!(matches!(
            parse_request_line("GET"),
            Err(RequestError::BadRequestLine)
        ));
        assert!(matches!(
            parse_request_line("GET index.html HTTP/1.0"),
            Err(RequestError::BadRequestLine)
        ));
        assert!(matches!(
            parse_request_line("PUT / HTTP/1.0"),
            Err(RequestError::UnsupportedMethod(method)) if method == "PUT"
        ));
        assert!(matches!(
            parse_request_line("HEAD / HTTP/1.0"),
            Err(RequestError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn normalize_path_works() {
        let test_cases = &[
            ("", None),
            ("/", Some("/")),
            ("/.", Some("/")),
            ("/./", Some("/")),
            ("/.d", Some("/.d")),
            ("//.d", Some("/.d")),
            ("/../", None),
            ("/abc", Some("/abc")),
            ("/abc/", Some("/abc/")),
            ("/abc/.", Some("/abc")),
            ("/abc/./", Some("/abc/")),
            ("/abc/..", Some("/")),
            ("/abc/../", Some("/")),
            ("/abc/../def", Some("/def")),
            ("/abc/../def/", Some("/def/")),
            ("/abc/../def/..", Some("/")),
            ("/abc/../def/../", Some("/")),
            ("/abc/../def/../../", None),
            ("/abc/../def/.././", Some("/")),
            ("/abc/../def/.././../", None),
            ("/a/b/c/../../d/", Some("/a/d/")),
            ("/a/b/../../../c", None),
            ("//a///b////c/////", Some("/a/b/c/")),
            ("/a/...", Some("/a/...")),
        ];
        for (path, expected) in test_cases {
            assert_eq!(
                normalize_path(path).ok(),
                expected.map(|s| s.to_string()),
                "{}",
                path
            );
        }
    }

    #[test]
    fn normalize_path_is_idempotent() {
        for path in ["/", "/a/b/", "/a/../b/./c", "//x//y", "/.d/e.f"] {
            let once = normalize_path(path).unwrap();
            assert_eq!(normalize_path(&once).unwrap(), once);
        }
    }

    #[test_case("/a%20b", "/a b" ; "escaped space")]
    #[test_case("/a/%2e%2e/b", "/b" ; "escaped dots")]
    fn decode_path_works(raw: &str, expected: &str) {
        assert_eq!(decode_path(raw).unwrap(), expected);
    }

    #[test]
    fn decode_path_rejects() {
        assert!(matches!(
            decode_path("/a%2Fb"),
            Err(RequestError::BadUrl(DecodeError::Forbidden(b'/')))
        ));
        assert!(matches!(
            decode_path("/%2e%2e/etc/passwd"),
            Err(RequestError::Traversal)
        ));
        assert!(matches!(decode_path("/bad%zz"), Err(RequestError::BadUrl(_))));
    }

    #[test]
    fn read_headers_works() {
        let mut incoming = buffered(
            b"Content-Length: 12\r\n\
              cookie:   a=b; c=d\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              Referer: http://example.com/\r\n\
              Authorization: Basic YWRtaW46c2V0dXA=\r\n\
              X-Ignored: yes\r\n\
              \r\n\
              body",
        );
        let headers = read_headers(&mut incoming, Method::Post).unwrap();
        assert_eq!(
            headers,
            Headers {
                content_length: 12,
                cookie: Some("a=b; c=d".into()),
                content_type: Some("application/x-www-form-urlencoded".into()),
                referer: Some("http://example.com/".into()),
                credentials: Some("admin:setup".into()),
            }
        );
        let mut body = String::new();
        incoming.read_to_string(&mut body).unwrap();
        assert_eq!(body, "body");
    }

    #[test]
    fn content_length_only_for_post() {
        let mut incoming = buffered(b"Content-length: 5\r\n\r\n");
        let headers = read_headers(&mut incoming, Method::Get).unwrap();
        assert_eq!(headers.content_length, 0);
    }

    #[test_case(b"Content-length: -1\r\n\r\n" ; "negative")]
    #[test_case(b"Content-length: lots\r\n\r\n" ; "not a number")]
    fn bad_content_length(data: &[u8]) {
        let mut incoming = buffered(data);
        assert!(matches!(
            read_headers(&mut incoming, Method::Post),
            Err(RequestError::BadContentLength(_))
        ));
    }

    #[test]
    fn only_basic_credentials() {
        let mut incoming = buffered(b"Authorization: Digest username=x\r\n\r\n");
        let headers = read_headers(&mut incoming, Method::Get).unwrap();
        assert_eq!(headers.credentials, None);

        let mut incoming = buffered(b"Authorization: basic !!!\r\n\r\n");
        let headers = read_headers(&mut incoming, Method::Get).unwrap();
        assert_eq!(headers.credentials, None);
    }

    #[test]
    fn read_request_works() {
        let mut incoming = buffered(b"Cookie: x=1\r\n\r\n");
        let request = read_request("GET /a/../b%20c?q=1 HTTP/1.0", &mut incoming).unwrap();
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path, "/b c");
        assert_eq!(request.query.as_deref(), Some("q=1"));
        assert_eq!(request.headers.cookie.as_deref(), Some("x=1"));

        // no headers are read for HTTP/0.9
        let mut incoming = buffered(b"Cookie: x=1\r\n\r\n");
        let request = read_request("GET /", &mut incoming).unwrap();
        assert_eq!(request.headers, Headers::default());
    }

    #[test]
    fn status_for_errors() {
        assert_eq!(RequestError::Timeout.status(), Some(Status::RequestTimeout));
        assert_eq!(
            RequestError::UnsupportedMethod("PUT".into()).status(),
            Some(Status::NotImplemented)
        );
        assert_eq!(RequestError::Traversal.status(), Some(Status::BadRequest));
        assert_eq!(
            RequestError::Io(io::ErrorKind::BrokenPipe.into()).status(),
            None
        );
    }

    #[test]
    fn detail_for_errors() {
        assert_eq!(
            RequestError::Traversal.detail(),
            Some("URL ascends above the document root.")
        );
        assert_eq!(
            decode_path("/bad%zz").unwrap_err().detail(),
            Some("Malformed URL encoding.")
        );
        assert_eq!(
            RequestError::BadContentLength("-1".into()).detail(),
            Some("Invalid Content-length.")
        );
        assert_eq!(RequestError::BadRequestLine.detail(), None);
        assert_eq!(RequestError::Timeout.detail(), None);
    }
}
