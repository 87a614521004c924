use std::collections::HashMap;

use crate::config::Config;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "audio/midi              mid midi",
    "audio/mpeg              mp3",
    "audio/wav               wav",
    "image/gif               gif",
    "image/jpeg              jpg jpeg",
    "image/png               png",
    "text/css                css",
    "text/html               htm html",
    "text/plain              txt h c cc cpp",
    "video/mpeg              mpe mpeg",
    "video/quicktime         qt mov",
    "video/x-msvideo         avi",
];

/// Built-in suffix table, consulted after the config's own `.suffix:type` rules.
#[derive(Debug)]
pub struct MimeMap {
    mimetypes: HashMap<String, String>,
}

impl MimeMap {
    /// Add line from an extension map.
    fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c| matches!(c, ' ' | '\t'))
            .filter(|field| !field.is_empty());
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype,
            None => return,
        };
        for extension in fields {
            self.mimetypes
                .insert(format!(".{}", extension), mimetype.to_string());
        }
    }

    /// Get content type for a path. Newer config rules win over older ones and over the
    /// built-in table.
    pub fn content_type<'a>(&'a self, path: &str, config: &'a Config) -> &'a str {
        let suffix = match path.rfind('.') {
            Some(index) if !path[index..].contains('/') => &path[index..],
            _ => return DEFAULT_MIME_TYPE,
        };
        config
            .mime_rules
            .iter()
            .find(|rule| rule.suffix == suffix)
            .map(|rule| rule.value.as_str())
            .or_else(|| self.mimetypes.get(suffix).map(String::as_str))
            .unwrap_or(DEFAULT_MIME_TYPE)
    }
}

impl Default for MimeMap {
    /// Create MimeMap using the default extension map.
    fn default() -> Self {
        let mut mime_map = Self {
            mimetypes: HashMap::new(),
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }
}
