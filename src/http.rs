//! Component I — HTTP Framing Helpers.
//!
//! Builds every response head the Client Request Actor sends. Grounded
//! directly on flexo's `reply_header`/`redirect_header` functions, folded
//! into one parametrized builder and updated to RFC-1123 dates via
//! `httpdate` (flexo used the no-longer-maintained `time` crate's
//! `rfc822()`).
//!
//! Per spec section 9's "Range semantics" note: a Range request is answered
//! with status `200 OK` plus a `Content-Range` header, not `206 Partial
//! Content` — preserved bit-exactly for client compatibility even though
//! RFC 7233 would prescribe 206.

use std::time::SystemTime;

const SERVER_HEADER: &str = "Server: cpcache\r\n";

fn date_header() -> String {
    format!("Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now()))
}

/// `200 OK`, optionally with a `Content-Range` when `range_start` is set.
/// `content_length` is always the number of bytes in *this* response body
/// (i.e. already `total - range_start` for ranged responses).
pub fn ok_header(content_length: u64, range_start: Option<u64>, total: u64) -> String {
    let content_range = range_start
        .map(|start| format!("Content-Range: bytes {}-{}/{}\r\n", start, total - 1, total))
        .unwrap_or_default();

    format!(
        "HTTP/1.1 200 OK\r\n{}{}{}Content-Length: {}\r\n\r\n",
        SERVER_HEADER,
        date_header(),
        content_range,
        content_length
    )
}

/// `301 Moved Permanently` redirecting to `location` (used for `.db` files
/// and for not-cached files requested with a `Range` header).
pub fn redirect_header(location: &str) -> String {
    format!(
        "HTTP/1.1 301 Moved Permanently\r\n{}{}Location: {}\r\nContent-Length: 0\r\n\r\n",
        SERVER_HEADER,
        date_header(),
        location
    )
}

pub fn not_found_header() -> String {
    status_only_header("404 Not Found")
}

pub fn bad_request_header() -> String {
    status_only_header("400 Bad Request")
}

pub fn forbidden_header() -> String {
    status_only_header("403 Forbidden")
}

pub fn payload_too_large_header() -> String {
    status_only_header("413 Payload Too Large")
}

pub fn internal_server_error_header() -> String {
    status_only_header("500 Internal Server Error")
}

fn status_only_header(status_line: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\n{}{}Content-Length: 0\r\n\r\n",
        status_line,
        SERVER_HEADER,
        date_header()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_header_without_range() {
        let header = ok_header(1000, None, 1000);
        assert!(header.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(header.contains("Content-Length: 1000\r\n"));
        assert!(!header.contains("Content-Range"));
        assert!(header.contains("Server: cpcache\r\n"));
        assert!(header.ends_with("\r\n\r\n"));
    }

    #[test]
    fn ok_header_with_range_uses_200_not_206() {
        let header = ok_header(750, Some(250), 1000);
        assert!(header.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(header.contains("Content-Range: bytes 250-999/1000\r\n"));
        assert!(header.contains("Content-Length: 750\r\n"));
    }

    #[test]
    fn redirect_includes_location() {
        let header = redirect_header("https://mirror.example/repo/core.db");
        assert!(header.starts_with("HTTP/1.1 301 Moved Permanently\r\n"));
        assert!(header.contains("Location: https://mirror.example/repo/core.db\r\n"));
    }

    #[test]
    fn status_only_headers_have_zero_length() {
        assert!(not_found_header().contains("Content-Length: 0\r\n"));
        assert!(bad_request_header().starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(forbidden_header().starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(payload_too_large_header().starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert!(internal_server_error_header().starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }
}
