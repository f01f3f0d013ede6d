//! Resumable streaming HTTP fetch.
//!
//! Downloads a URL into `<destination>.part` with chunked writes (each chunk
//! hits disk before the next is read), then atomically renames on success.
//! A non-empty `.part` turns into a byte-range request; the server's answer
//! decides whether we append (`206`), rename-and-finish (`416` with a full
//! part), or restart from zero (`200` to a ranged request). A low-speed
//! abort acts as the inactivity watchdog: fewer than one byte per second
//! over the configured window kills the transfer with `Stall`.
//!
//! Runs blocking; callers drive it from `spawn_blocking`.

mod parse;
mod progress;

pub use parse::{filename_from_url, sanitize_filename};
pub use progress::{Progress, ProgressFn, ProgressThrottle};

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::failure::{classify_curl_error, FailureClass};

/// Inputs for one fetch attempt.
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub destination: &'a Path,
    /// Server-declared size when the intake event carried one.
    pub expected_size: Option<u64>,
    pub chunk_size: usize,
    pub inactivity_timeout: Duration,
    pub auth_token: Option<&'a str>,
}

/// Result of a successful fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    pub final_size: u64,
    /// Offset the transfer actually started at (0 after a range reset).
    pub resumed_from: u64,
}

/// The `.part` sibling of a destination path.
pub fn part_path(destination: &Path) -> PathBuf {
    let mut os = destination.as_os_str().to_os_string();
    os.push(".part");
    PathBuf::from(os)
}

struct StreamState {
    part_path: PathBuf,
    file: Option<std::fs::File>,
    /// Offset the range request asked for.
    offset_requested: u64,
    /// Absolute size of the part file as written so far.
    bytes_written: u64,
    status: Option<u32>,
    headers: Vec<String>,
    total_hint: Option<u64>,
    range_reset: bool,
    canceled: bool,
    write_error: Option<String>,
    progress: ProgressThrottle,
}

/// Fetch `req.url` to `req.destination`, resuming any existing `.part`.
///
/// On every failure the `.part` file is left intact for the next attempt,
/// except the range-ignore reset (deleted before the restart) and a final
/// size exceeding the declared length (deleted, classified `Integrity`).
pub fn fetch_to_path(
    req: &FetchRequest<'_>,
    abort: Option<Arc<AtomicBool>>,
    progress: ProgressThrottle,
) -> Result<FetchOutcome, FailureClass> {
    let part = part_path(req.destination);

    let mut offset = match std::fs::metadata(&part) {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    if offset == 0 {
        // A zero-byte part carries no resume value; start clean.
        let _ = std::fs::remove_file(&part);
    }
    if offset > 0 {
        tracing::debug!(part = %part.display(), offset, "resuming partial download");
    }

    let state = Arc::new(Mutex::new(StreamState {
        part_path: part.clone(),
        file: None,
        offset_requested: offset,
        bytes_written: offset,
        status: None,
        headers: Vec::new(),
        total_hint: None,
        range_reset: false,
        canceled: false,
        write_error: None,
        progress,
    }));

    let mut easy = curl::easy::Easy::new();
    easy.url(req.url).map_err(|e| FailureClass::Unknown(e.to_string()))?;
    easy.follow_location(true).map_err(curl_unknown)?;
    easy.max_redirections(10).map_err(curl_unknown)?;
    easy.connect_timeout(Duration::from_secs(30)).map_err(curl_unknown)?;
    easy.buffer_size(req.chunk_size.max(4096)).map_err(curl_unknown)?;
    // Inactivity watchdog: under 1 byte/sec across the window aborts.
    easy.low_speed_limit(1).map_err(curl_unknown)?;
    easy.low_speed_time(req.inactivity_timeout).map_err(curl_unknown)?;
    if offset > 0 {
        easy.range(&format!("{offset}-")).map_err(curl_unknown)?;
    }
    if let Some(token) = req.auth_token {
        let mut list = curl::easy::List::new();
        list.append(&format!("Authorization: Bearer {token}"))
            .map_err(curl_unknown)?;
        easy.http_headers(list).map_err(curl_unknown)?;
    }
    if abort.is_some() {
        easy.progress(true).map_err(curl_unknown)?;
    }

    let perform_result = {
        let mut transfer = easy.transfer();

        let header_state = Arc::clone(&state);
        transfer
            .header_function(move |data| {
                if let Ok(line) = std::str::from_utf8(data) {
                    let line = line.trim_end();
                    let mut st = header_state.lock().unwrap();
                    if let Some(code) = parse::parse_status_line(line) {
                        // New response block (redirect hop): drop stale headers.
                        st.status = Some(code);
                        st.headers.clear();
                    } else if !line.is_empty() {
                        st.headers.push(line.to_string());
                    }
                }
                true
            })
            .map_err(curl_unknown)?;

        let write_state = Arc::clone(&state);
        let write_abort = abort.clone();
        transfer
            .write_function(move |data| {
                let mut st = write_state.lock().unwrap();
                if write_abort
                    .as_ref()
                    .map(|a| a.load(Ordering::Relaxed))
                    .unwrap_or(false)
                {
                    st.canceled = true;
                    return Ok(0);
                }

                let status = st.status.unwrap_or(200);
                if !(200..300).contains(&status) {
                    // Body of an error response; abort and classify by code.
                    return Ok(0);
                }

                if st.file.is_none() {
                    if status != 206 && st.offset_requested > 0 {
                        // Server ignored the range: discard the part and
                        // restart the file from zero.
                        tracing::debug!(
                            part = %st.part_path.display(),
                            "server ignored range request; restarting from zero"
                        );
                        let _ = std::fs::remove_file(&st.part_path);
                        st.range_reset = true;
                        st.bytes_written = 0;
                    }
                    st.total_hint = match status {
                        206 => parse::content_range_total(&st.headers),
                        _ => parse::content_length(&st.headers),
                    };
                    let file = match OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&st.part_path)
                    {
                        Ok(f) => f,
                        Err(e) => {
                            st.write_error = Some(format!("open part file: {e}"));
                            return Ok(0);
                        }
                    };
                    st.file = Some(file);
                }

                if let Some(file) = st.file.as_mut() {
                    if let Err(e) = file.write_all(data) {
                        st.write_error = Some(format!("write part file: {e}"));
                        return Ok(0);
                    }
                }
                st.bytes_written += data.len() as u64;
                let (done, total) = (st.bytes_written, st.total_hint);
                st.progress.update(done, total);
                Ok(data.len())
            })
            .map_err(curl_unknown)?;

        if let Some(abort) = abort.clone() {
            transfer
                .progress_function(move |_, _, _, _| !abort.load(Ordering::Relaxed))
                .map_err(curl_unknown)?;
        }

        transfer.perform()
    };

    let mut st = Arc::try_unwrap(state)
        .map_err(|_| FailureClass::Unknown("stream state still shared".into()))?
        .into_inner()
        .unwrap();
    if let Some(file) = st.file.take() {
        let _ = file.sync_data();
    }

    if let Err(e) = perform_result {
        if st.canceled {
            return Err(FailureClass::Canceled);
        }
        if let Some(msg) = st.write_error {
            return Err(FailureClass::Unknown(msg));
        }
        // An aborted error body falls through to status classification.
        if let Some(code) = st.status.filter(|c| !(200..300).contains(c)) {
            return Err(FailureClass::HttpStatus(code));
        }
        return Err(classify_curl_error(&e));
    }

    let code = easy.response_code().unwrap_or(0);
    match code {
        // Unsatisfiable range: if the part already holds the whole file the
        // download is complete, otherwise the part is wrong for this URL.
        416 => {
            let total = parse::content_range_total(&st.headers).or(req.expected_size);
            let part_size = std::fs::metadata(&part).map(|m| m.len()).unwrap_or(0);
            if total == Some(part_size) && part_size > 0 {
                finalize(&part, req.destination)?;
                st.progress.finish(part_size, total);
                return Ok(FetchOutcome {
                    final_size: part_size,
                    resumed_from: offset,
                });
            }
            Err(FailureClass::HttpStatus(416))
        }
        c if (200..300).contains(&c) => {
            if st.range_reset {
                offset = 0;
            }
            let part_size = std::fs::metadata(&part).map(|m| m.len()).unwrap_or(0);
            let declared = st.total_hint.or(req.expected_size);
            if let Some(total) = declared {
                if part_size < total {
                    return Err(FailureClass::Incomplete);
                }
                if part_size > total {
                    // The part can never exceed the declared length.
                    let _ = std::fs::remove_file(&part);
                    return Err(FailureClass::Integrity);
                }
            }
            finalize(&part, req.destination)?;
            st.progress.finish(part_size, declared);
            Ok(FetchOutcome {
                final_size: part_size,
                resumed_from: offset,
            })
        }
        c => Err(FailureClass::HttpStatus(c)),
    }
}

fn finalize(part: &Path, destination: &Path) -> Result<(), FailureClass> {
    std::fs::rename(part, destination)
        .map_err(|e| FailureClass::Unknown(format!("rename part into place: {e}")))
}

fn curl_unknown(e: curl::Error) -> FailureClass {
    FailureClass::Unknown(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/tmp/file.zip")),
            PathBuf::from("/tmp/file.zip.part")
        );
    }
}
