//! Access rules, auth credentials, MIME overrides and script interpreters read from `httpd.conf`.
//!
//! ```text
//! A:172.20.         # allow address from 172.20.0.0/16
//! A:10.0.0.0/255.255.255.128  # allow access from 10.0.0.0-10.0.0.127
//! A:127.0.0.1       # allow local loopback connections
//! D:*               # deny from other IP connections
//! /cgi-bin:foo:bar  # require user foo, pwd bar on urls starting with /cgi-bin/
//! /adm:admin:setup  # require user admin, pwd setup on urls starting with /adm/
//! /adm:toor:$1$P/eKnWXS$aI1aPGxT.dJD5SzqAKWrF0  # or user toor, MD5-crypt password
//! .au:audio/basic   # additional mime type for audio.au files
//! *.php:/path/php   # run xxx.php through an interpreter
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Name of the config file, both at the top level and inside subdirectories.
pub const CONFIG_FILE_NAME: &str = "httpd.conf";
const SYSTEM_CONFIG_PATH: &str = "/etc/httpd.conf";

/// How a config file is being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode<'a> {
    /// Startup: build everything from scratch.
    First,
    /// A subdirectory on the request path has its own config. The scope is the directory
    /// relative to the document root, without a leading slash.
    Subdir(&'a str),
    /// Reload requested while running: same as `First`.
    Reload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRule {
    pub network: u32,
    pub mask: u32,
    pub action: Action,
}

impl IpRule {
    pub fn matches(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask == self.network
    }
}

/// `/prefix:user:password` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRule {
    pub prefix: String,
    pub user: String,
    /// Plain text or MD5-crypt hash. `None` when the line had no password field, which
    /// never authenticates.
    pub password: Option<String>,
}

/// `.suffix:value` or `*.suffix:value` line. The suffix keeps its leading dot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuffixRule {
    pub suffix: String,
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Deny rules first, then allow rules, each in file order.
    pub ip_rules: Vec<IpRule>,
    /// Set by `D:*`; decides for addresses no rule matches.
    pub deny_all: bool,
    /// Longest prefix first.
    pub auth_rules: Vec<AuthRule>,
    /// Newest first.
    pub mime_rules: Vec<SuffixRule>,
    /// Newest first.
    pub interpreters: Vec<SuffixRule>,
}

impl Config {
    /// Read the startup (or reloaded) configuration.
    ///
    /// An explicitly given file must be readable. Without one, `/etc/httpd.conf` and then
    /// `httpd.conf` in the document root are tried, and an empty configuration is used if
    /// neither exists.
    pub fn load(explicit: Option<&Path>, root: &Path, mode: ParseMode<'_>) -> Result<Self> {
        let empty = Self::default();
        if let Some(path) = explicit {
            return empty
                .parse(path, mode)
                .with_context(|| format!("failed to read config file {}", path.display()));
        }
        let candidates = [PathBuf::from(SYSTEM_CONFIG_PATH), root.join(CONFIG_FILE_NAME)];
        for path in &candidates {
            match empty.parse(path, mode) {
                Ok(config) => {
                    debug!(path = %path.display(), "loaded config");
                    return Ok(config);
                }
                Err(e) => debug!(path = %path.display(), error = %e, "config not used"),
            }
        }
        Ok(empty)
    }

    /// Derive the configuration for a request that walks into `subdir`, if that directory has
    /// its own config file. Returns `None` when there is nothing to merge.
    pub fn for_subdir(&self, root: &Path, subdir: &str) -> Option<Self> {
        let path = root.join(subdir).join(CONFIG_FILE_NAME);
        match self.parse(&path, ParseMode::Subdir(subdir)) {
            Ok(config) => Some(config),
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "subdirectory config not used");
                }
                None
            }
        }
    }

    /// Parse the config file at `path` on top of `self` according to `mode`.
    pub fn parse(&self, path: &Path, mode: ParseMode<'_>) -> io::Result<Self> {
        let file = File::open(path)?;
        self.parse_reader(BufReader::new(file), mode)
    }

    /// Parse config lines from `reader`. Malformed lines are skipped.
    pub fn parse_reader<R: BufRead>(&self, reader: R, mode: ParseMode<'_>) -> io::Result<Self> {
        let mut config = match mode {
            ParseMode::First | ParseMode::Reload => Self::default(),
            ParseMode::Subdir(_) => Self {
                ip_rules: Vec::new(),
                deny_all: false,
                ..self.clone()
            },
        };
        let scope = match mode {
            ParseMode::Subdir(scope) => scope,
            _ => "",
        };
        for line in reader.split(b'\n') {
            let line = line?;
            config.add_line(&String::from_utf8_lossy(&line), scope);
        }
        Ok(config)
    }

    /// Add a single config line.
    fn add_line(&mut self, line: &str, scope: &str) {
        let line: String = line
            .split('#')
            .next()
            .unwrap_or("")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let (key, value) = match line.split_once(':') {
            Some((key, value)) if !value.is_empty() => (key, value),
            _ => return, // empty or strange line
        };
        let kind = match key.chars().next() {
            Some(c) => c.to_ascii_uppercase(),
            None => return,
        };

        if value.starts_with('*') {
            // defaults; only `D:*` means anything
            if kind == 'D' {
                self.deny_all = true;
            }
            return;
        }

        match kind {
            'A' | 'D' => self.add_ip_rule(kind, value),
            '/' => self.add_auth_rule(key, value, scope),
            '.' => self.mime_rules.insert(
                0,
                SuffixRule {
                    suffix: key.to_string(),
                    value: value.to_string(),
                },
            ),
            '*' if key.starts_with("*.") => self.interpreters.insert(
                0,
                SuffixRule {
                    suffix: key[1..].to_string(),
                    value: value.to_string(),
                },
            ),
            _ => {}
        }
    }

    fn add_ip_rule(&mut self, kind: char, value: &str) {
        let rule = match parse_ip_mask(value) {
            Some((network, mask)) => IpRule {
                network: network & mask,
                mask,
                action: if kind == 'A' {
                    Action::Allow
                } else {
                    Action::Deny
                },
            },
            None => {
                // protect everything rather than guess
                debug!(rule = value, "malformed address rule, denying all");
                IpRule {
                    network: 0,
                    mask: 0,
                    action: Action::Deny,
                }
            }
        };
        match rule.action {
            Action::Deny => self.ip_rules.insert(0, rule),
            Action::Allow => self.ip_rules.push(rule),
        }
    }

    fn add_auth_rule(&mut self, key: &str, value: &str, scope: &str) {
        let prefix = simplify_prefix(&format!("/{}{}", scope, key));
        let (user, password) = match value.split_once(':') {
            Some((user, password)) => (user.to_string(), Some(password.to_string())),
            None => (value.to_string(), None),
        };
        let index = self
            .auth_rules
            .iter()
            .position(|rule| prefix.len() >= rule.prefix.len())
            .unwrap_or(self.auth_rules.len());
        self.auth_rules.insert(
            index,
            AuthRule {
                prefix,
                user,
                password,
            },
        );
    }
}

/// Resolve `//`, `/./` and `/../` in an auth prefix and drop any trailing slash.
fn simplify_prefix(raw: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Parse `ip[/mask]`, where ip may give fewer than four octets (`172.20.`) and mask is either a
/// prefix length or a dotted quad. Without a mask, each given octet contributes 8 bits.
pub fn parse_ip_mask(value: &str) -> Option<(u32, u32)> {
    let (address, mask) = match value.split_once('/') {
        Some((address, mask)) => (address, Some(mask)),
        None => (value, None),
    };

    let address = address.strip_suffix('.').unwrap_or(address);
    let octets = address
        .split('.')
        .map(|octet| octet.parse::<u8>().ok())
        .collect::<Option<Vec<u8>>>()?;
    if octets.is_empty() || octets.len() > 4 {
        return None;
    }
    let network = octets
        .iter()
        .chain(std::iter::repeat(&0))
        .take(4)
        .fold(0u32, |acc, &octet| acc << 8 | octet as u32);

    let mask = match mask {
        None => prefix_mask(8 * octets.len() as u32),
        Some(mask) if mask.contains('.') => u32::from(mask.parse::<Ipv4Addr>().ok()?),
        Some(mask) => match mask.parse::<u32>() {
            Ok(bits) if bits <= 32 => prefix_mask(bits),
            _ => return None,
        },
    };
    Some((network, mask))
}

fn prefix_mask(bits: u32) -> u32 {
    u32::MAX.checked_shl(32 - bits).unwrap_or(0)
}
