//! Minimal HTTP/1.1 server with Range GET support for integration tests.
//!
//! Serves a single static body. Options simulate the failure modes the
//! fetcher must survive: servers that ignore Range, that stall mid-body,
//! or that declare more bytes than they send.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RangeServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// Stop sending after this many bytes and hold the connection open.
    pub stall_after: Option<usize>,
    /// Declare this Content-Length regardless of how much is actually sent.
    pub declared_length: Option<u64>,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            stall_after: None,
            declared_length: None,
        }
    }
}

/// Starts a server in a background thread serving `body`. Returns the base
/// URL. The server runs until the process exits.
pub fn start(body: Vec<u8>) -> String {
    start_with_options(body, RangeServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            thread::spawn(move || handle(stream, &body, opts));
        }
    });
    format!("http://127.0.0.1:{}/file.bin", port)
}

fn handle(mut stream: std::net::TcpStream, body: &[u8], opts: RangeServerOptions) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) => return,
        Ok(n) => n,
        Err(_) => return,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let (method, range) = parse_request(request);
    if !method.eq_ignore_ascii_case("GET") && !method.eq_ignore_ascii_case("PROPFIND") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n");
        return;
    }

    let total = body.len() as u64;
    let (status, range_header, slice) = if opts.support_ranges {
        match range {
            Some((start, end_incl)) => {
                let end_incl = end_incl.min(total.saturating_sub(1));
                if start > end_incl || start >= total {
                    (
                        "416 Range Not Satisfiable".to_string(),
                        format!("bytes */{}", total),
                        &body[0..0],
                    )
                } else {
                    let s = start as usize;
                    let e = (end_incl + 1).min(total) as usize;
                    (
                        "206 Partial Content".to_string(),
                        format!("bytes {}-{}/{}", s, e - 1, total),
                        &body[s..e],
                    )
                }
            }
            None => (
                "200 OK".to_string(),
                String::new(),
                body,
            ),
        }
    } else {
        // Range-oblivious server: 200 with the full body, always.
        ("200 OK".to_string(), String::new(), body)
    };

    let declared = opts.declared_length.unwrap_or(slice.len() as u64);
    let range_line = if range_header.is_empty() {
        String::new()
    } else {
        format!("Content-Range: {range_header}\r\n")
    };
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {declared}\r\n{range_line}Accept-Ranges: bytes\r\n\r\n"
    );
    let _ = stream.write_all(response.as_bytes());

    match opts.stall_after {
        Some(cut) if cut < slice.len() => {
            let _ = stream.write_all(&slice[..cut]);
            let _ = stream.flush();
            // Hold the connection open without sending further bytes so the
            // client's inactivity watchdog fires.
            thread::sleep(Duration::from_secs(30));
        }
        _ => {
            let _ = stream.write_all(slice);
        }
    }
}

/// Returns (method, optional (start, end_inclusive) for `Range: bytes=X-Y`).
fn parse_request(request: &str) -> (&str, Option<(u64, u64)>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if let Some(part) = value.strip_prefix("bytes=") {
                    if let Some((a, b)) = part.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, range)
}
