//! Parse HTTP response header lines collected during a transfer.

/// Parse a status line like `HTTP/1.1 206 Partial Content` into the code.
pub(crate) fn parse_status_line(line: &str) -> Option<u32> {
    let mut parts = line.split_whitespace();
    let proto = parts.next()?;
    if !proto.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// `Content-Length` value, if present.
pub(crate) fn content_length(lines: &[String]) -> Option<u64> {
    header_value(lines, "content-length")?.parse().ok()
}

/// Total size from a `Content-Range` header, covering both the satisfied
/// form `bytes 5-9/100` and the unsatisfiable form `bytes */100`.
pub(crate) fn content_range_total(lines: &[String]) -> Option<u64> {
    let value = header_value(lines, "content-range")?;
    let rest = value.strip_prefix("bytes")?.trim();
    let total = rest.rsplit('/').next()?.trim();
    total.parse().ok()
}

fn header_value(lines: &[String], name: &str) -> Option<String> {
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            if k.trim().eq_ignore_ascii_case(name) {
                return Some(v.trim().to_string());
            }
        }
    }
    None
}

/// Derive a safe local filename from a URL, falling back to `download.bin`.
/// Path separators, control characters, and over-long names are rejected.
pub fn filename_from_url(url: &str) -> String {
    let candidate = url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .unwrap_or_default();
    sanitize_filename(&candidate)
}

/// Strip anything that could escape the download directory or break the
/// filesystem; empty results fall back to `download.bin`.
pub fn sanitize_filename(name: &str) -> String {
    let decoded = percent_decode(name);
    let cleaned: String = decoded
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches(['.', ' ']).to_string();
    if cleaned.is_empty() {
        return "download.bin".to_string();
    }
    if cleaned.len() > 200 {
        return cleaned.chars().take(200).collect();
    }
    cleaned
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(v) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
