//! ffmpeg transcode execution: bounded runtime, cooperative kill, parsed
//! progress, thumbnail capture.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::failure::FailureClass;
use crate::fetcher::ProgressThrottle;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Run ffmpeg to normalize `input` into `output`: even dimensions, h264 +
/// aac, moov atom up front. Kills the encoder and removes partial output on
/// timeout or abort.
pub fn run_transcode(
    ffmpeg_path: &Path,
    input: &Path,
    output: &Path,
    duration_secs: Option<f64>,
    timeout: Duration,
    progress: &mut ProgressThrottle,
    abort: Option<Arc<AtomicBool>>,
) -> Result<(), FailureClass> {
    let mut child = Command::new(ffmpeg_path)
        .arg("-y")
        .arg("-i")
        .arg(input.as_os_str())
        .arg("-c:v")
        .arg("libx264")
        .arg("-preset")
        .arg("veryfast")
        .arg("-pix_fmt")
        .arg("yuv420p")
        .arg("-vf")
        .arg("scale=trunc(iw/2)*2:trunc(ih/2)*2")
        .arg("-c:a")
        .arg("aac")
        .arg("-movflags")
        .arg("+faststart")
        .arg("-progress")
        .arg("pipe:1")
        .arg("-nostats")
        .arg("-loglevel")
        .arg("error")
        .arg(output.as_os_str())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| FailureClass::Unknown(format!("spawn ffmpeg: {e}")))?;

    // Progress lines arrive as key=value pairs; a reader thread folds
    // out_time into a shared microsecond counter.
    let out_us = Arc::new(AtomicU64::new(0));
    let reader_handle = child.stdout.take().map(|stdout| {
        let out_us = Arc::clone(&out_us);
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if let Some(value) = line.strip_prefix("out_time_us=") {
                    if let Ok(us) = value.trim().parse::<u64>() {
                        out_us.store(us, Ordering::Relaxed);
                    }
                } else if let Some(value) = line.strip_prefix("out_time_ms=") {
                    if let Ok(us) = value.trim().parse::<u64>() {
                        out_us.store(us, Ordering::Relaxed);
                    }
                }
            }
        })
    });

    let started = Instant::now();
    let status = loop {
        if let Some(abort) = &abort {
            if abort.load(Ordering::Relaxed) {
                kill_and_clean(&mut child, output);
                return Err(FailureClass::Canceled);
            }
        }
        if started.elapsed() > timeout {
            tracing::warn!(
                input = %input.display(),
                elapsed = ?started.elapsed(),
                "encoder exceeded runtime bound; killing"
            );
            kill_and_clean(&mut child, output);
            return Err(FailureClass::NormalizeTimeout);
        }

        if let Some(total) = duration_secs.filter(|d| *d > 0.0) {
            let done_secs = out_us.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            let pct_base = ((done_secs / total) * 100.0).min(100.0) as u64;
            progress.update(pct_base, Some(100));
        }

        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => {
                kill_and_clean(&mut child, output);
                return Err(FailureClass::Unknown(format!("wait ffmpeg: {e}")));
            }
        }
    };

    if let Some(handle) = reader_handle {
        let _ = handle.join();
    }

    if !status.success() {
        let stderr = child
            .stderr
            .take()
            .map(|mut s| {
                let mut buf = String::new();
                use std::io::Read;
                let _ = s.read_to_string(&mut buf);
                buf
            })
            .unwrap_or_default();
        let _ = std::fs::remove_file(output);
        return Err(FailureClass::Unknown(format!(
            "ffmpeg exited with {status}: {}",
            stderr.trim()
        )));
    }

    progress.finish(100, Some(100));
    Ok(())
}

/// Capture a single-frame thumbnail near the start of a video. Best-effort:
/// failures return None.
pub fn capture_thumbnail(ffmpeg_path: &Path, video: &Path, out: &Path) -> Option<PathBuf> {
    let status = Command::new(ffmpeg_path)
        .arg("-y")
        .arg("-ss")
        .arg("1")
        .arg("-i")
        .arg(video.as_os_str())
        .arg("-frames:v")
        .arg("1")
        .arg("-q:v")
        .arg("4")
        .arg("-loglevel")
        .arg("error")
        .arg(out.as_os_str())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .ok()?;
    if status.success() && out.exists() {
        Some(out.to_path_buf())
    } else {
        let _ = std::fs::remove_file(out);
        None
    }
}

fn kill_and_clean(child: &mut std::process::Child, output: &Path) {
    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_file(output);
}
