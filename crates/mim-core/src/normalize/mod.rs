//! Media normalization: decide whether a video needs re-encoding and run
//! the encoder when it does.
//!
//! Three outcomes: passthrough (already playable), inline convert (fast
//! path, bounded runtime), defer (hand off to the conversion ledger so the
//! album pipeline is never blocked by a long encode).

mod probe;
mod transcode;

pub use probe::{probe_media, MediaProbe};
pub use transcode::{capture_thumbnail, run_transcode};

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::config::TranscodeConfig;
use crate::failure::FailureClass;
use crate::fetcher::ProgressThrottle;

/// What to do with a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeDecision {
    Passthrough,
    Inline,
    Defer,
}

/// Result of a completed normalization.
#[derive(Debug, Clone)]
pub struct NormalizeOutput {
    pub path: PathBuf,
    pub duration_secs: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub thumbnail: Option<PathBuf>,
}

/// Containers/codecs the outbound platform plays without help.
fn is_compatible(probe: &MediaProbe) -> bool {
    let container_ok = probe.container.split(',').any(|c| {
        matches!(c.trim(), "mp4" | "mov" | "m4a" | "m4v" | "3gp" | "3g2" | "mj2")
    });
    let video_ok = matches!(probe.video_codec.as_deref(), Some("h264") | Some("hevc"));
    let audio_ok = matches!(probe.audio_codec.as_deref(), None | Some("aac") | Some("mp3"));
    container_ok && video_ok && audio_ok
}

/// Decide passthrough / inline / defer for `file`.
pub fn decide(file: &Path, probe: &MediaProbe, cfg: &TranscodeConfig) -> NormalizeDecision {
    // Transport streams pass through regardless of the toggle.
    let is_ts = file
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("ts"))
        .unwrap_or(false);
    if is_ts {
        return NormalizeDecision::Passthrough;
    }

    if is_compatible(probe) {
        return NormalizeDecision::Passthrough;
    }

    if !cfg.enabled {
        return NormalizeDecision::Defer;
    }

    match probe.duration_secs {
        Some(d) if d > cfg.inline_max_duration_secs => NormalizeDecision::Defer,
        // Unknown duration means unknown cost; keep it off the live path.
        None => NormalizeDecision::Defer,
        Some(_) => NormalizeDecision::Inline,
    }
}

/// Collaborator seam for probing and converting media; faked in tests and
/// by the deferred-conversion worker's scripted runs.
pub trait Encoder: Send + Sync {
    fn probe(&self, file: &Path) -> anyhow::Result<MediaProbe>;

    /// Convert `input` into a normalized sibling. Must delete partial output
    /// and classify as `NormalizeTimeout` when the bound is exceeded.
    fn normalize(
        &self,
        input: &Path,
        output: &Path,
        duration_hint: Option<f64>,
        timeout: Duration,
        progress: &mut ProgressThrottle,
        abort: Option<Arc<AtomicBool>>,
    ) -> Result<NormalizeOutput, FailureClass>;
}

/// ffmpeg/ffprobe-backed encoder.
pub struct FfmpegEncoder {
    cfg: TranscodeConfig,
}

impl FfmpegEncoder {
    pub fn new(cfg: TranscodeConfig) -> Self {
        Self { cfg }
    }

    /// Conventional output path for a normalized file: `<stem>.norm.mp4`.
    pub fn output_path_for(input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("video");
        input.with_file_name(format!("{stem}.norm.mp4"))
    }
}

impl Encoder for FfmpegEncoder {
    fn probe(&self, file: &Path) -> anyhow::Result<MediaProbe> {
        probe_media(&self.cfg.ffprobe_path, file)
    }

    fn normalize(
        &self,
        input: &Path,
        output: &Path,
        duration_hint: Option<f64>,
        timeout: Duration,
        progress: &mut ProgressThrottle,
        abort: Option<Arc<AtomicBool>>,
    ) -> Result<NormalizeOutput, FailureClass> {
        run_transcode(
            &self.cfg.ffmpeg_path,
            input,
            output,
            duration_hint,
            timeout,
            progress,
            abort,
        )?;

        // Re-derive attributes from the finished file; fall back to the
        // input's hint when probing the output fails.
        let out_probe = probe_media(&self.cfg.ffprobe_path, output).unwrap_or_default();
        let thumb_path = output.with_extension("thumb.jpg");
        let thumbnail = capture_thumbnail(&self.cfg.ffmpeg_path, output, &thumb_path);

        Ok(NormalizeOutput {
            path: output.to_path_buf(),
            duration_secs: out_probe.duration_secs.or(duration_hint),
            width: out_probe.width,
            height: out_probe.height,
            thumbnail,
        })
    }
}
