//! Request-line rewriting for traffic headed to the hub.
//!
//! A notebook client believes it talks to a single-user server and issues
//! requests such as `GET /api/kernels HTTP/1.1`. The hub in front of the real
//! server only routes `/user/<name>/api/...`, so the first line of every chunk
//! read from the client is inspected and the API prefix is scoped to the
//! configured user.
//!
//! The rewrite works on whatever a single read returned. A request line that
//! is split across two reads is forwarded untouched.

use bytes::Bytes;

/// Path prefix that identifies a bare API request. The leading space anchors
/// it to the request target of the request line.
pub const API_MARKER: &str = " /api/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    marker: String,
    replacement: String,
}

/// What the rewriter decided for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Not valid UTF-8; forward the original bytes as-is.
    Binary,
    /// Text, but the first line carries no marker.
    Unchanged,
    /// First line rewritten; forward these bytes instead.
    Rewritten(Bytes),
}

impl RewriteRule {
    pub fn new(marker: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            replacement: replacement.into(),
        }
    }

    /// ` /api/` -> ` /user/<username>/api/`
    pub fn for_user(username: &str) -> Self {
        Self::new(API_MARKER, format!(" /user/{}/api/", username))
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    pub fn apply(&self, chunk: &[u8]) -> Outcome {
        let text = match std::str::from_utf8(chunk) {
            Ok(text) => text,
            Err(_) => return Outcome::Binary,
        };

        let line_end = text.find('\n').unwrap_or(text.len());
        let (first_line, rest) = text.split_at(line_end);

        if self.marker.is_empty() || !first_line.contains(&self.marker) {
            return Outcome::Unchanged;
        }

        let mut rewritten = first_line.replace(&self.marker, &self.replacement);
        rewritten.push_str(rest);
        Outcome::Rewritten(Bytes::from(rewritten))
    }

    /// Convenience wrapper returning the bytes to forward.
    pub fn rewrite(&self, chunk: Bytes) -> Bytes {
        match self.apply(&chunk) {
            Outcome::Rewritten(bytes) => bytes,
            Outcome::Binary | Outcome::Unchanged => chunk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> RewriteRule {
        RewriteRule::for_user("alice")
    }

    #[test]
    fn test_rewrites_api_request_line() {
        let chunk = b"GET /api/kernels HTTP/1.1\r\nHost: x\r\n\r\n";
        let out = alice().rewrite(Bytes::from_static(chunk));
        assert_eq!(
            &out[..],
            b"GET /user/alice/api/kernels HTTP/1.1\r\nHost: x\r\n\r\n"
        );
    }

    #[test]
    fn test_second_pass_is_noop() {
        let rule = alice();
        let once = rule.rewrite(Bytes::from_static(b"POST /api/sessions HTTP/1.1\r\n\r\n"));
        let first_line = std::str::from_utf8(&once).unwrap().lines().next().unwrap().to_string();
        assert!(!first_line.contains(API_MARKER));
        assert_eq!(rule.apply(&once), Outcome::Unchanged);
    }

    #[test]
    fn test_only_first_line_is_touched() {
        let chunk = b"GET /tree HTTP/1.1\r\nReferer: http://h /api/x\r\n\r\n";
        assert_eq!(alice().apply(chunk), Outcome::Unchanged);

        let chunk = b"GET /api/a HTTP/1.1\r\nX-Path: /api/b\r\n GET /api/c\r\n";
        let out = alice().rewrite(Bytes::from_static(chunk));
        assert_eq!(
            &out[..],
            &b"GET /user/alice/api/a HTTP/1.1\r\nX-Path: /api/b\r\n GET /api/c\r\n"[..]
        );
    }

    #[test]
    fn test_binary_passthrough() {
        let chunk: &[u8] = &[0x81, 0xfe, 0x00, 0xff, b' ', b'/', b'a', b'p', b'i', b'/'];
        assert_eq!(alice().apply(chunk), Outcome::Binary);
        let out = alice().rewrite(Bytes::copy_from_slice(chunk));
        assert_eq!(&out[..], chunk);
    }

    #[test]
    fn test_marker_requires_leading_space() {
        assert_eq!(alice().apply(b"GET /x/api/y HTTP/1.1\r\n"), Outcome::Unchanged);
        assert_eq!(alice().apply(b""), Outcome::Unchanged);
    }

    #[test]
    fn test_line_without_newline() {
        let out = alice().rewrite(Bytes::from_static(b"GET /api/status"));
        assert_eq!(&out[..], b"GET /user/alice/api/status");
    }

    #[test]
    fn test_split_request_line_is_not_detected() {
        let rule = alice();
        assert_eq!(rule.apply(b"GET /ap"), Outcome::Unchanged);
        assert_eq!(rule.apply(b"i/kernels HTTP/1.1\r\n"), Outcome::Unchanged);
    }
}
