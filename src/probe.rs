use std::{path::Path, process::Command};

use crate::error::{OverlayError, OverlayResult};

/// Extract per-packet presentation timestamps for one stream of a video file,
/// in milliseconds, sorted ascending.
///
/// Packet ordering in the container is not guaranteed monotonic, hence the
/// sort. Packets without a `pts_time` entry are skipped; a stream exposing no
/// packets at all is reported as `InvalidStream`.
pub fn probe_timestamps_ms(path: &Path, stream_index: usize) -> OverlayResult<Vec<i64>> {
    if !path.is_file() {
        return Err(OverlayError::not_found(format!(
            "invalid path for the video file: '{}'",
            path.display()
        )));
    }

    let out = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            &stream_index.to_string(),
            "-show_entries",
            "packet=pts_time:stream=codec_type",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .map_err(|e| OverlayError::subprocess(format!("failed to run ffprobe: {e}")))?;

    if !out.status.success() {
        return Err(OverlayError::subprocess(format!(
            "ffprobe failed for '{}': {}",
            path.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    parse_probe_output(&out.stdout, stream_index)
}

#[derive(serde::Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
}

#[derive(serde::Deserialize)]
struct ProbePacket {
    pts_time: Option<String>,
}

#[derive(serde::Deserialize)]
struct ProbeOut {
    #[serde(default)]
    packets: Vec<ProbePacket>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

/// Pure parse step over the ffprobe JSON document.
pub(crate) fn parse_probe_output(bytes: &[u8], stream_index: usize) -> OverlayResult<Vec<i64>> {
    let parsed: ProbeOut = serde_json::from_slice(bytes)
        .map_err(|e| OverlayError::subprocess(format!("ffprobe json parse failed: {e}")))?;

    match parsed.streams.first() {
        Some(stream) if stream.codec_type.as_deref() == Some("video") => {}
        Some(stream) => {
            return Err(OverlayError::wrong_stream_type(format!(
                "stream {stream_index} is '{}', not video",
                stream.codec_type.as_deref().unwrap_or("unknown")
            )));
        }
        None => {
            return Err(OverlayError::invalid_stream(format!(
                "no stream at index {stream_index}"
            )));
        }
    }

    if parsed.packets.is_empty() {
        return Err(OverlayError::invalid_stream(format!(
            "stream {stream_index} has no packets"
        )));
    }

    let mut pts = Vec::with_capacity(parsed.packets.len());
    for packet in &parsed.packets {
        if let Some(s) = packet.pts_time.as_deref() {
            pts.push(pts_time_to_ms(s)?);
        }
    }
    pts.sort_unstable();
    Ok(pts)
}

/// Convert a fractional-second decimal string to integer milliseconds,
/// truncating toward zero, without an f64 round trip of the integer part.
fn pts_time_to_ms(s: &str) -> OverlayResult<i64> {
    let malformed =
        || OverlayError::subprocess(format!("ffprobe returned malformed pts_time '{s}'"));

    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    if !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }

    let seconds: i64 = int_part.parse().map_err(|_| malformed())?;
    let mut millis = 0i64;
    for i in 0..3 {
        let digit = frac_part.as_bytes().get(i).map_or(0, |b| i64::from(b - b'0'));
        millis = millis * 10 + digit;
    }

    let value = seconds
        .checked_mul(1000)
        .and_then(|v| v.checked_add(millis))
        .ok_or_else(malformed)?;
    Ok(if negative { -value } else { value })
}
