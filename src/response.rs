//! Deciding what to do with a parsed request, and formatting the replies we generate ourselves.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::access::AuthOutcome;
use crate::config::{Config, CONFIG_FILE_NAME};
use crate::encode::{HttpDate, UrlEncoded};
use crate::mime::MimeMap;
use crate::request::{Method, Request};

pub const DEFAULT_INDEX_NAME: &str = "index.html";
pub const CGI_PREFIX: &str = "/cgi-bin/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Found,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RequestTimeout,
    InternalServerError,
    NotImplemented,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Found => 302,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::RequestTimeout => 408,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Found => "Found",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::RequestTimeout => "Request Timeout",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
        }
    }

    /// Text for the generated HTML body. Successful replies have none.
    fn info(self) -> Option<&'static str> {
        match self {
            Self::Ok => None,
            Self::Found => Some("Directories must end with a slash."),
            Self::BadRequest => Some("Unsupported method."),
            Self::Unauthorized | Self::Forbidden => Some(""),
            Self::NotFound => Some("The requested URL was not found on this server."),
            Self::RequestTimeout => Some("No request appeared within a reasonable time period."),
            Self::InternalServerError => Some("Internal Server Error"),
            Self::NotImplemented => Some("The requested method is not recognized by this server."),
        }
    }
}

/// What to answer a request with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    ServeFile { path: PathBuf, mime: String },
    /// Run the script named by the (normalized) request path.
    RunCgi { path: String },
    /// Send the client to the given location.
    Redirect(String),
    Error(Status),
}

/// Routes authorized requests to exactly one handler.
pub struct Dispatcher<'a> {
    pub root: &'a Path,
    pub config: &'a Config,
    pub mime_map: &'a MimeMap,
}

impl<'a> Dispatcher<'a> {
    pub fn decide(&self, request: &Request, ip_allowed: bool, auth: &AuthOutcome) -> Decision {
        let path = request.path.as_str();
        let last_component = path.rsplit('/').next().unwrap_or("");
        if last_component == CONFIG_FILE_NAME || !ip_allowed {
            return Decision::Error(Status::Forbidden);
        }
        if *auth == AuthOutcome::Unauthorized {
            return Decision::Error(Status::Unauthorized);
        }
        let relative = path.trim_start_matches('/');
        if !path.ends_with('/') && self.root.join(relative).is_dir() {
            let location = match &request.query {
                Some(query) => format!("{}/?{}", encode_path(path), query),
                None => format!("{}/", encode_path(path)),
            };
            return Decision::Redirect(location);
        }
        if path == CGI_PREFIX {
            return Decision::Error(Status::Forbidden);
        }
        if path.starts_with(CGI_PREFIX) {
            return Decision::RunCgi {
                path: path.to_string(),
            };
        }
        if request.method == Method::Post {
            return Decision::Error(Status::NotImplemented);
        }
        let url = if path.ends_with('/') {
            format!("{}{}", path, DEFAULT_INDEX_NAME)
        } else {
            path.to_string()
        };
        Decision::ServeFile {
            mime: self.mime_map.content_type(&url, self.config).to_string(),
            path: self.root.join(url.trim_start_matches('/')),
        }
    }
}

/// Percent-encode each segment of a decoded path.
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| UrlEncoded(segment).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Status line and the headers every reply carries.
fn common_headers(status: Status, mimetype: &str, now: SystemTime) -> String {
    format!(
        "HTTP/1.0 {} {}\r\n\
        Content-type: {}\r\n\
        Date: {}\r\n\
        Connection: close\r\n",
        status.code(),
        status.reason(),
        mimetype,
        HttpDate(now),
    )
}

fn body(status: Status, info: Option<&str>) -> String {
    info.or_else(|| status.info())
        .map(|info| {
            format!(
                "<HEAD><TITLE>{code} {name}</TITLE></HEAD>\n\
                <BODY><H1>{code} {name}</H1>\n\
                {info}\n\
                </BODY>\n",
                code = status.code(),
                name = status.reason(),
                info = info,
            )
        })
        .unwrap_or_default()
}

/// A default reply for any (erroneous) occasion.
pub fn error_reply(status: Status, realm: &str, now: SystemTime) -> String {
    error_reply_with_info(status, None, realm, now)
}

/// Like [`error_reply`], with `info` in the body instead of the status's usual text.
pub fn error_reply_with_info(
    status: Status,
    info: Option<&str>,
    realm: &str,
    now: SystemTime,
) -> String {
    let mut reply = common_headers(status, "text/html", now);
    if status == Status::Unauthorized {
        reply.push_str(&format!(
            "WWW-Authenticate: Basic realm=\"{}\"\r\n",
            realm
        ));
    }
    reply.push_str("\r\n");
    reply.push_str(&body(status, info));
    reply
}

/// A redirect reply.
pub fn redirect_reply(location: &str, now: SystemTime) -> String {
    format!(
        "{}Location: {}\r\n\r\n{}",
        common_headers(Status::Found, "text/html", now),
        location,
        body(Status::Found, None),
    )
}

/// Headers for a file of `length` bytes.
pub fn file_headers(mimetype: &str, length: u64, modified: SystemTime, now: SystemTime) -> String {
    format!(
        "{}Last-Modified: {}\r\n\
        Content-length: {}\r\n\
        \r\n",
        common_headers(Status::Ok, mimetype, now),
        HttpDate(modified),
        length,
    )
}

/// A regular file opened for sending.
pub struct OpenFile {
    file: File,
    length: u64,
    modified: Option<SystemTime>,
}

impl OpenFile {
    /// Open `path`, or `None` if it is not an openable regular file.
    pub fn open(path: &Path) -> Option<Self> {
        let file = File::open(path).ok()?;
        let metadata = file.metadata().ok().filter(|metadata| metadata.is_file())?;
        Some(Self {
            file,
            length: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }

    pub fn headers(&self, mimetype: &str, now: SystemTime) -> String {
        file_headers(mimetype, self.length, self.modified.unwrap_or(now), now)
    }

    /// Copy the contents to `out`. Returns the number of bytes sent.
    pub fn send<W: Write>(&mut self, out: &mut W) -> io::Result<u64> {
        let sent = io::copy(&mut self.file, out)?;
        out.flush()?;
        Ok(sent)
    }
}
