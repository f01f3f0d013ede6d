//! Oversize-photo recovery: re-encode at descending JPEG qualities, then
//! downscale, until the outbound size limit is met.
//!
//! Transparency is flattened to an opaque background as part of the
//! re-encode (JPEG carries no alpha). The original file is never touched;
//! substitutes land next to it as `<stem>.shrunk-N.jpg`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Outbound platform byte limit for a photo upload.
pub const PHOTO_BYTE_LIMIT: u64 = 10 * 1024 * 1024;

/// qscale ladder roughly covering JPEG quality 90 down to 50.
const QUALITY_LADDER: [u32; 5] = [3, 5, 8, 12, 15];
/// Dimension fallbacks applied at mid quality when the ladder alone fails.
const SCALE_LADDER: [&str; 2] = ["3/4", "1/2"];

/// Produce a substitute for `input` that fits under `byte_limit`, or None
/// when every strategy is exhausted.
pub fn shrink_photo(
    ffmpeg_path: &Path,
    input: &Path,
    byte_limit: u64,
) -> Result<Option<PathBuf>> {
    let mut attempt = 0usize;

    for q in QUALITY_LADDER {
        attempt += 1;
        let out = substitute_path(input, attempt);
        if reencode(ffmpeg_path, input, &out, q, None)? && fits(&out, byte_limit) {
            return Ok(Some(out));
        }
        let _ = std::fs::remove_file(&out);
    }

    for scale in SCALE_LADDER {
        attempt += 1;
        let out = substitute_path(input, attempt);
        if reencode(ffmpeg_path, input, &out, 8, Some(scale))? && fits(&out, byte_limit) {
            return Ok(Some(out));
        }
        let _ = std::fs::remove_file(&out);
    }

    tracing::warn!(
        input = %input.display(),
        byte_limit,
        "photo still over the size limit after recompression and downscale"
    );
    Ok(None)
}

fn substitute_path(input: &Path, attempt: usize) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("photo");
    input.with_file_name(format!("{stem}.shrunk-{attempt}.jpg"))
}

fn fits(path: &Path, byte_limit: u64) -> bool {
    std::fs::metadata(path)
        .map(|m| m.len() <= byte_limit && m.len() > 0)
        .unwrap_or(false)
}

/// One ffmpeg re-encode pass. Returns false when ffmpeg rejects the input.
fn reencode(
    ffmpeg_path: &Path,
    input: &Path,
    output: &Path,
    qscale: u32,
    scale_factor: Option<&str>,
) -> Result<bool> {
    // Flatten alpha against an opaque background, keep dimensions even for
    // the chroma subsampling, and optionally downscale.
    let filter = match scale_factor {
        Some(f) => format!(
            "format=rgb24,scale=trunc(iw*{f}/2)*2:trunc(ih*{f}/2)*2,format=yuvj420p"
        ),
        None => "format=rgb24,scale=trunc(iw/2)*2:trunc(ih/2)*2,format=yuvj420p".to_string(),
    };

    let status = Command::new(ffmpeg_path)
        .arg("-y")
        .arg("-i")
        .arg(input.as_os_str())
        .arg("-vf")
        .arg(&filter)
        .arg("-q:v")
        .arg(qscale.to_string())
        .arg("-frames:v")
        .arg("1")
        .arg("-loglevel")
        .arg("error")
        .arg(output.as_os_str())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("spawn ffmpeg for photo shrink: {}", input.display()))?;

    Ok(status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_names_are_unique_per_attempt() {
        let a = substitute_path(Path::new("/x/big.png"), 1);
        let b = substitute_path(Path::new("/x/big.png"), 2);
        assert_eq!(a, PathBuf::from("/x/big.shrunk-1.jpg"));
        assert_ne!(a, b);
    }

    #[test]
    fn fits_rejects_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("x.jpg");
        assert!(!fits(&p, 100));
        std::fs::write(&p, b"").unwrap();
        assert!(!fits(&p, 100));
        std::fs::write(&p, vec![0u8; 50]).unwrap();
        assert!(fits(&p, 100));
        assert!(!fits(&p, 10));
    }
}
