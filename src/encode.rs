//! Formatting helpers for dates, URLs, HTML and log lines.

use std::fmt;
use std::time::SystemTime;

use chrono::{DateTime, Local, Utc};
use thiserror::Error;

/// RFC1123 formatted date.
pub struct HttpDate(pub SystemTime);

impl fmt::Display for HttpDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime = DateTime::<Utc>::from(self.0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
pub struct ClfDate(pub SystemTime);

impl fmt::Display for ClfDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime = DateTime::<Local>::from(self.0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// Encode string to be an RFC3986-compliant URL part.
pub struct UrlEncoded<'a>(pub &'a str);

impl<'a> fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
                write!(f, "{}", c)?;
            } else {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for b in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", b)?;
                }
            }
        }
        Ok(())
    }
}

/// How `url_decode` treats `+` and broken escapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// Request paths: `+` is literal, bad escapes and escaped `/` or NUL are errors.
    Path,
    /// Query strings and form data: `+` is a space, bad escapes pass through.
    Form,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed percent escape")]
    Malformed,
    #[error("escaped byte {0:#04x} is not allowed")]
    Forbidden(u8),
    #[error("decoded URL is not valid UTF-8")]
    InvalidUtf8,
}

/// Decode URL by converting %XX (where XX are hexadecimal digits) to the character it represents.
pub fn url_decode(url: &str, mode: DecodeMode) -> Result<String, DecodeError> {
    let url = url.as_bytes();
    let mut decoded = Vec::with_capacity(url.len());
    let mut i = 0;
    while i < url.len() {
        let c = url[i];
        if c == b'+' && mode == DecodeMode::Form {
            decoded.push(b' ');
            i += 1;
        } else if c != b'%' {
            decoded.push(c);
            i += 1;
        } else if i + 2 < url.len()
            && url[i + 1].is_ascii_hexdigit()
            && url[i + 2].is_ascii_hexdigit()
        {
            let value = hex_to_digit(url[i + 1]) * 16 + hex_to_digit(url[i + 2]);
            if value == 0 || (value == b'/' && mode == DecodeMode::Path) {
                return Err(DecodeError::Forbidden(value));
            }
            decoded.push(value);
            i += 3;
        } else if mode == DecodeMode::Form {
            decoded.push(c);
            i += 1;
        } else {
            return Err(DecodeError::Malformed);
        }
    }
    String::from_utf8(decoded).map_err(|_| DecodeError::InvalidUtf8)
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if (b'A'..=b'F').contains(&hex) {
        hex - b'A' + 10
    } else if (b'a'..=b'f').contains(&hex) {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}

/// Encode everything but ASCII letters and digits as an HTML numeric entity.
pub struct HtmlEncoded<'a>(pub &'a str);

impl<'a> fmt::Display for HtmlEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() {
                write!(f, "{}", c)?;
            } else {
                write!(f, "&#{};", c as u32)?;
            }
        }
        Ok(())
    }
}

/// Encode string for logging. Logs should not contain control characters or double quotes.
pub struct LogEncoded<'a>(pub &'a str);

impl<'a> fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if !c.is_ascii() || c.is_ascii_control() || c == '"' {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for b in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", b)?;
                }
            } else {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}
