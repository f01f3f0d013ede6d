//! WebDAV collection crawling (Depth-1 PROPFIND).
//!
//! External share links that point at a collection are expanded into one
//! `WebdavFile` download per member file; nested collections come back as
//! further crawl targets. Parsing is deliberately shallow: multistatus
//! responses are scanned per `<response>` block for href, content length,
//! and the collection marker, without a full XML stack.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use url::Url;

use crate::failure::{classify_curl_error, FailureClass};
use crate::fetcher::sanitize_filename;

/// One member of a crawled collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebdavEntry {
    pub url: String,
    pub name: String,
    pub size: Option<u64>,
    pub is_collection: bool,
}

/// List the members of a WebDAV collection.
pub fn crawl_collection(
    base_url: &str,
    auth_token: Option<&str>,
) -> Result<Vec<WebdavEntry>, FailureClass> {
    let base = Url::parse(base_url)
        .map_err(|e| FailureClass::Permanent(format!("bad webdav url: {e}")))?;

    let body = Arc::new(Mutex::new(Vec::<u8>::new()));
    let mut easy = curl::easy::Easy::new();
    easy.url(base_url).map_err(unknown)?;
    easy.custom_request("PROPFIND").map_err(unknown)?;
    easy.connect_timeout(Duration::from_secs(30)).map_err(unknown)?;
    easy.low_speed_limit(1).map_err(unknown)?;
    easy.low_speed_time(Duration::from_secs(60)).map_err(unknown)?;

    let mut headers = curl::easy::List::new();
    headers.append("Depth: 1").map_err(unknown)?;
    headers
        .append("Content-Type: application/xml")
        .map_err(unknown)?;
    if let Some(token) = auth_token {
        headers
            .append(&format!("Authorization: Bearer {token}"))
            .map_err(unknown)?;
    }
    easy.http_headers(headers).map_err(unknown)?;

    {
        let sink = Arc::clone(&body);
        let mut transfer = easy.transfer();
        transfer
            .write_function(move |data| {
                sink.lock().unwrap().extend_from_slice(data);
                Ok(data.len())
            })
            .map_err(unknown)?;
        transfer.perform().map_err(|e| classify_curl_error(&e))?;
    }

    let code = easy.response_code().unwrap_or(0);
    if code != 207 {
        return Err(FailureClass::HttpStatus(code));
    }

    let body = body.lock().unwrap();
    let text = String::from_utf8_lossy(&body);
    Ok(parse_multistatus(&base, &text))
}

/// Extract member entries from a multistatus body, skipping the collection
/// itself.
fn parse_multistatus(base: &Url, body: &str) -> Vec<WebdavEntry> {
    let response_re =
        Regex::new(r"(?is)<(?:[a-z0-9_-]+:)?response[^>]*>(.*?)</(?:[a-z0-9_-]+:)?response>")
            .expect("static regex");
    let href_re = Regex::new(r"(?is)<(?:[a-z0-9_-]+:)?href[^>]*>(.*?)</(?:[a-z0-9_-]+:)?href>")
        .expect("static regex");
    let len_re = Regex::new(
        r"(?is)<(?:[a-z0-9_-]+:)?getcontentlength[^>]*>(\d+)</(?:[a-z0-9_-]+:)?getcontentlength>",
    )
    .expect("static regex");
    let coll_re =
        Regex::new(r"(?is)<(?:[a-z0-9_-]+:)?collection\s*/?>").expect("static regex");

    let base_path = base.path().trim_end_matches('/').to_string();
    let mut out = Vec::new();

    for block in response_re.captures_iter(body) {
        let block = &block[1];
        let Some(href) = href_re.captures(block).map(|c| c[1].trim().to_string()) else {
            continue;
        };
        let Ok(resolved) = base.join(&href) else {
            tracing::warn!(href, "skipping unresolvable webdav href");
            continue;
        };
        // The collection lists itself first; skip it.
        if resolved.path().trim_end_matches('/') == base_path {
            continue;
        }
        let is_collection = coll_re.is_match(block) || href.ends_with('/');
        let size = len_re
            .captures(block)
            .and_then(|c| c[1].parse::<u64>().ok());
        let name = resolved
            .path_segments()
            .and_then(|mut s| s.next_back().map(str::to_string))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "entry".to_string());
        out.push(WebdavEntry {
            url: resolved.to_string(),
            name: sanitize_filename(&name),
            size,
            is_collection,
        });
    }
    out
}

fn unknown(e: curl::Error) -> FailureClass {
    FailureClass::Unknown(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTISTATUS: &str = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/share/photos/</D:href>
    <D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/share/photos/a%20cat.jpg</D:href>
    <D:propstat><D:prop>
      <D:getcontentlength>12345</D:getcontentlength>
      <D:resourcetype/>
    </D:prop></D:propstat>
  </D:response>
  <D:response>
    <D:href>/share/photos/nested/</D:href>
    <D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;

    #[test]
    fn parses_files_and_nested_collections() {
        let base = Url::parse("https://dav.example/share/photos/").unwrap();
        let entries = parse_multistatus(&base, MULTISTATUS);
        assert_eq!(entries.len(), 2, "the collection itself is skipped");

        let file = &entries[0];
        assert_eq!(file.name, "a cat.jpg");
        assert_eq!(file.size, Some(12345));
        assert!(!file.is_collection);
        assert_eq!(file.url, "https://dav.example/share/photos/a%20cat.jpg");

        let nested = &entries[1];
        assert!(nested.is_collection);
        assert!(nested.url.ends_with("/nested/"));
    }

    #[test]
    fn mixed_namespace_prefixes_are_accepted() {
        let body = MULTISTATUS.replace("D:", "lp1:");
        let base = Url::parse("https://dav.example/share/photos/").unwrap();
        let entries = parse_multistatus(&base, &body);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn empty_body_yields_nothing() {
        let base = Url::parse("https://dav.example/x/").unwrap();
        assert!(parse_multistatus(&base, "").is_empty());
    }
}
