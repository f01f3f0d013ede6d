//! ffprobe wrapper: container, codecs, dimensions, duration.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;

/// What ffprobe reports about a media file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaProbe {
    pub container: String,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<f64>,
}

/// Run ffprobe and parse its JSON output.
pub fn probe_media(ffprobe_path: &Path, source: &Path) -> Result<MediaProbe> {
    let output = Command::new(ffprobe_path)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(source.as_os_str())
        .output()
        .with_context(|| format!("failed to run ffprobe on {}", source.display()))?;

    if !output.status.success() {
        anyhow::bail!(
            "ffprobe failed for {}: {}",
            source.display(),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    parse_probe_json(&output.stdout)
}

pub(crate) fn parse_probe_json(stdout: &[u8]) -> Result<MediaProbe> {
    let value: serde_json::Value =
        serde_json::from_slice(stdout).context("ffprobe output is not JSON")?;

    let mut probe = MediaProbe::default();

    if let Some(format) = value.get("format") {
        probe.container = format
            .get("format_name")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        probe.duration_secs = format
            .get("duration")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok());
    }

    if let Some(streams) = value.get("streams").and_then(|v| v.as_array()) {
        for stream in streams {
            let codec_type = stream.get("codec_type").and_then(|v| v.as_str());
            let codec_name = stream
                .get("codec_name")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            match codec_type {
                Some("video") if probe.video_codec.is_none() => {
                    probe.video_codec = codec_name;
                    probe.width = stream.get("width").and_then(|v| v.as_u64()).map(|v| v as u32);
                    probe.height = stream.get("height").and_then(|v| v.as_u64()).map(|v| v as u32);
                }
                Some("audio") if probe.audio_codec.is_none() => {
                    probe.audio_codec = codec_name;
                }
                _ => {}
            }
        }
    }

    Ok(probe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_probe_output() {
        let json = r#"{
            "streams": [
                {"codec_type": "video", "codec_name": "h264", "width": 1280, "height": 719},
                {"codec_type": "audio", "codec_name": "aac"}
            ],
            "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "12.480000"}
        }"#;
        let probe = parse_probe_json(json.as_bytes()).unwrap();
        assert_eq!(probe.video_codec.as_deref(), Some("h264"));
        assert_eq!(probe.audio_codec.as_deref(), Some("aac"));
        assert_eq!(probe.width, Some(1280));
        assert_eq!(probe.height, Some(719));
        assert_eq!(probe.duration_secs, Some(12.48));
        assert!(probe.container.contains("mp4"));
    }

    #[test]
    fn missing_streams_default_to_none() {
        let probe = parse_probe_json(br#"{"format": {"format_name": "matroska,webm"}}"#).unwrap();
        assert!(probe.video_codec.is_none());
        assert!(probe.duration_secs.is_none());
        assert_eq!(probe.container, "matroska,webm");
    }

    #[test]
    fn garbage_output_errors() {
        assert!(parse_probe_json(b"not json").is_err());
    }
}
