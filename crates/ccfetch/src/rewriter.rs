//! Output naming

use crate::record::IndexRecord;

// Longest name produced from a URL; most filesystems cap a segment at 255 bytes.
const MAX_URL_NAME_LEN: usize = 200;

/// Capability: derive a target name for a record. Must be pure.
pub trait PathRewriter: Send + Sync {
    fn rewrite(&self, record: &IndexRecord) -> String;
}

/// Names outputs after the payload digest, fanned out into directories.
///
/// Each `x` in the pattern takes the next digest character and anything else
/// is copied as-is. The whole digest is then appended, so `xx/xx` turns
/// `ABCDEF` into `AB/CD/ABCDEF`. Records without a digest fall back to a
/// sanitised form of their URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestPathRewriter {
    pattern: String,
}

impl DigestPathRewriter {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Reject patterns whose names would escape or break the sink layout.
    ///
    /// A trailing `/` is allowed; every other segment must be non-empty and
    /// must not be `.` or `..`.
    pub fn check_pattern(pattern: &str) -> Result<(), &'static str> {
        if pattern.contains('\\') {
            return Err("backslashes are not allowed");
        }
        if pattern.starts_with('/') {
            return Err("must be relative, remove the leading '/'");
        }

        if pattern.is_empty() {
            return Ok(());
        }

        let segments: Vec<&str> = pattern
            .strip_suffix('/')
            .unwrap_or(pattern)
            .split('/')
            .collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err("contains an empty segment");
        }
        if segments.iter().any(|s| *s == "." || *s == "..") {
            return Err("'.' and '..' segments are not allowed");
        }
        Ok(())
    }

    fn apply(&self, key: &str) -> String {
        if self.pattern.is_empty() {
            return key.to_string();
        }

        let mut chars = key.chars();
        let mut out = String::with_capacity(self.pattern.len() + key.len() + 1);
        for p in self.pattern.chars() {
            if p == 'x' {
                match chars.next() {
                    Some(c) => out.push(c),
                    None => break,
                }
            } else {
                out.push(p);
            }
        }

        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(key);
        out
    }
}

impl PathRewriter for DigestPathRewriter {
    fn rewrite(&self, record: &IndexRecord) -> String {
        match record.digest.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            Some(digest) => self.apply(&sanitize(digest)),
            None => self.apply(&name_from_url(&record.url)),
        }
    }
}

/// Flatten a URL into one safe path segment, e.g. `example.com_docs_a.pdf`.
pub fn name_from_url(raw: &str) -> String {
    let flat = match url::Url::parse(raw) {
        Ok(parsed) => {
            let mut s = parsed.host_str().unwrap_or_default().to_string();
            s.push_str(parsed.path());
            if let Some(query) = parsed.query() {
                s.push('_');
                s.push_str(query);
            }
            s
        }
        Err(_) => raw.to_string(),
    };

    let mut name = sanitize(flat.trim_matches('/'));
    if name.len() > MAX_URL_NAME_LEN {
        let mut cut = MAX_URL_NAME_LEN;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }

    match name.as_str() {
        "" => "unnamed".to_string(),
        "." | ".." => format!("_{}", name),
        _ => name,
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
