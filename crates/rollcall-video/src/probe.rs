//! Stream metadata via `ffprobe`.

use rollcall_core::{VideoError, VideoInfo};
use serde::Deserialize;
use std::path::Path;
use std::process::Command;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    tags: ProbeTags,
    #[serde(default)]
    side_data_list: Vec<ProbeSideData>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeTags {
    rotate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeSideData {
    rotation: Option<f64>,
}

impl ProbeStream {
    /// Display rotation in degrees, from the display matrix side data or the
    /// legacy `rotate` tag.
    fn rotation(&self) -> Option<f64> {
        self.side_data_list
            .iter()
            .find_map(|d| d.rotation)
            .or_else(|| self.tags.rotate.as_deref().and_then(|r| r.trim().parse().ok()))
    }
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Probe the first video stream of `path`.
pub fn probe(path: &Path) -> Result<VideoInfo, VideoError> {
    let open_err = |reason: String| VideoError::Open {
        path: path.display().to_string(),
        reason,
    };

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,avg_frame_rate,r_frame_rate,nb_frames,duration\
             :stream_tags=rotate:stream_side_data=rotation:format=duration",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .map_err(|e| open_err(format!("failed to run ffprobe (is ffmpeg installed?): {e}")))?;

    if !output.status.success() {
        return Err(open_err(String::from_utf8_lossy(&output.stderr).trim().to_string()));
    }

    let info = parse_probe(&output.stdout).map_err(open_err)?;
    tracing::debug!(path = %path.display(), ?info, "probed video");
    Ok(info)
}

fn parse_probe(json: &[u8]) -> Result<VideoInfo, String> {
    let parsed: ProbeOutput = serde_json::from_slice(json).map_err(|e| format!("bad ffprobe output: {e}"))?;
    let stream = parsed.streams.into_iter().next().ok_or("no video stream")?;

    let (Some(coded_width), Some(coded_height)) = (stream.width, stream.height) else {
        return Err("video stream has no dimensions".into());
    };
    if coded_width == 0 || coded_height == 0 {
        return Err(format!("invalid frame size {coded_width}x{coded_height}"));
    }
    // ffmpeg applies the display rotation when decoding, so quarter turns
    // swap the frame dimensions.
    let quarter_turn = stream
        .rotation()
        .is_some_and(|r| (r.round() as i64).rem_euclid(180) == 90);
    let (width, height) = if quarter_turn {
        (coded_height, coded_width)
    } else {
        (coded_width, coded_height)
    };

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate));

    // Containers like MKV omit nb_frames; estimate from duration like most decoders do.
    let duration = stream
        .duration
        .or_else(|| parsed.format.and_then(|f| f.duration))
        .and_then(|d| d.parse::<f64>().ok());
    let total_frames = stream
        .nb_frames
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|&n| n > 0)
        .or_else(|| match (duration, fps) {
            (Some(d), Some(f)) if d > 0.0 => Some((d * f).round() as u64),
            _ => None,
        });

    Ok(VideoInfo {
        fps,
        total_frames,
        width,
        height,
    })
}

/// Parse an ffprobe rational such as `30000/1001`. `0/0` yields `None`.
fn parse_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num.trim().parse::<f64>().ok()? / den
        }
        None => rate.trim().parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("30/1"), Some(30.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("25"), Some(25.0));
        assert_eq!(parse_rate("abc"), None);
    }

    #[test]
    fn test_parse_probe_mp4() {
        let json = br#"{
            "programs": [],
            "streams": [{"width": 1280, "height": 720, "avg_frame_rate": "30/1",
                         "r_frame_rate": "30/1", "nb_frames": "900", "duration": "30.000000"}],
            "format": {"duration": "30.000000"}
        }"#;
        let info = parse_probe(json).unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert_eq!(info.fps, Some(30.0));
        assert_eq!(info.total_frames, Some(900));
    }

    #[test]
    fn test_portrait_phone_video_reports_rotated_size() {
        let json = br#"{
            "streams": [{"width": 1920, "height": 1080, "avg_frame_rate": "30/1", "nb_frames": "300",
                         "side_data_list": [{"side_data_type": "Display Matrix", "rotation": -90}]}]
        }"#;
        let info = parse_probe(json).unwrap();
        assert_eq!((info.width, info.height), (1080, 1920));
    }

    #[test]
    fn test_legacy_rotate_tag_swaps_quarter_turns_only() {
        let json = br#"{"streams": [{"width": 1280, "height": 720, "tags": {"rotate": "270"}}]}"#;
        let info = parse_probe(json).unwrap();
        assert_eq!((info.width, info.height), (720, 1280));

        let upside_down = br#"{"streams": [{"width": 1280, "height": 720, "tags": {"rotate": "180"}}]}"#;
        let info = parse_probe(upside_down).unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
    }

    #[test]
    fn test_parse_probe_estimates_frame_count() {
        let json = br#"{
            "streams": [{"width": 640, "height": 360, "avg_frame_rate": "0/0", "r_frame_rate": "25/1"}],
            "format": {"duration": "12.0"}
        }"#;
        let info = parse_probe(json).unwrap();
        assert_eq!(info.fps, Some(25.0));
        assert_eq!(info.total_frames, Some(300));
    }

    #[test]
    fn test_parse_probe_without_rate() {
        let json = br#"{"streams": [{"width": 320, "height": 240}]}"#;
        let info = parse_probe(json).unwrap();
        assert_eq!(info.fps, None);
        assert_eq!(info.total_frames, None);
    }

    #[test]
    fn test_parse_probe_rejects_missing_stream() {
        assert!(parse_probe(br#"{"streams": []}"#).is_err());
        assert!(parse_probe(br#"{"streams": [{"width": 0, "height": 240}]}"#).is_err());
        assert!(parse_probe(b"not json").is_err());
    }
}
