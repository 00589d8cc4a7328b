use std::{
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Child, ChildStdout, Command, Stdio},
};

use crate::{
    error::{OverlayError, OverlayResult},
    frame::FrameRgb,
};

/// Probed metadata for a video file.
#[derive(Clone, Debug)]
pub struct VideoContext {
    pub path: PathBuf,
    pub fps: f64,
    pub total_frames: u64,
    pub width: u32,
    pub height: u32,
    pub duration_sec: f64,
}

impl VideoContext {
    /// Probe stream metadata. Failing to open the file for analysis is fatal
    /// for the job (there is nothing to decode).
    pub fn open(path: &Path) -> OverlayResult<Self> {
        #[derive(serde::Deserialize)]
        struct ProbeStream {
            codec_type: Option<String>,
            width: Option<u32>,
            height: Option<u32>,
            r_frame_rate: Option<String>,
            nb_frames: Option<String>,
        }
        #[derive(serde::Deserialize)]
        struct ProbeFormat {
            duration: Option<String>,
        }
        #[derive(serde::Deserialize)]
        struct ProbeOut {
            #[serde(default)]
            streams: Vec<ProbeStream>,
            format: Option<ProbeFormat>,
        }

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
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .output()
            .map_err(|e| OverlayError::subprocess(format!("failed to run ffprobe: {e}")))?;
        if !out.status.success() {
            return Err(OverlayError::decode(format!(
                "cannot open '{}' for decoding: {}",
                path.display(),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        let parsed: ProbeOut = serde_json::from_slice(&out.stdout)
            .map_err(|e| OverlayError::decode(format!("ffprobe json parse failed: {e}")))?;
        let stream = parsed
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .ok_or_else(|| {
                OverlayError::wrong_stream_type(format!(
                    "no video stream in '{}'",
                    path.display()
                ))
            })?;

        let width = stream
            .width
            .ok_or_else(|| OverlayError::decode("missing video width from ffprobe"))?;
        let height = stream
            .height
            .ok_or_else(|| OverlayError::decode("missing video height from ffprobe"))?;
        let (fps_num, fps_den) = parse_ff_ratio(stream.r_frame_rate.as_deref().unwrap_or("0/1"))
            .ok_or_else(|| OverlayError::decode("invalid video r_frame_rate"))?;
        let fps = if fps_den == 0 {
            0.0
        } else {
            f64::from(fps_num) / f64::from(fps_den)
        };

        let duration_sec = parsed
            .format
            .as_ref()
            .and_then(|f| f.duration.as_ref())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let total_frames = stream
            .nb_frames
            .as_ref()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or_else(|| (duration_sec * fps).round() as u64);

        Ok(Self {
            path: path.to_path_buf(),
            fps,
            total_frames,
            width,
            height,
            duration_sec,
        })
    }
}

/// Sequential rawvideo decoder backed by an ffmpeg child process.
///
/// Frames arrive in presentation order as tightly packed rgb24; the reader
/// owns the child and reaps it on `close` or drop.
pub struct VideoReader {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    frames_read: u64,
}

impl VideoReader {
    pub fn open(ctx: &VideoContext) -> OverlayResult<Self> {
        let mut child = Command::new("ffmpeg")
            .args(["-v", "error", "-i"])
            .arg(&ctx.path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                OverlayError::decode(format!("failed to spawn ffmpeg for video decode: {e}"))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OverlayError::decode("failed to open ffmpeg stdout (unexpected)"))?;

        Ok(Self {
            child,
            stdout,
            width: ctx.width,
            height: ctx.height,
            frames_read: 0,
        })
    }

    /// Read the next frame. `Ok(None)` is a clean end of stream; a partial
    /// frame is an error the caller may treat as a non-fatal truncation.
    pub fn read_frame(&mut self) -> OverlayResult<Option<FrameRgb>> {
        let frame_len = self.width as usize * self.height as usize * 3;
        let mut buf = vec![0u8; frame_len];
        let mut filled = 0usize;
        while filled < frame_len {
            match self.stdout.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(OverlayError::decode(format!(
                        "frame read failed at frame {}: {e}",
                        self.frames_read
                    )));
                }
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < frame_len {
            return Err(OverlayError::decode(format!(
                "truncated frame {} ({filled} of {frame_len} bytes)",
                self.frames_read
            )));
        }

        self.frames_read += 1;
        Ok(Some(FrameRgb::from_raw(self.width, self.height, buf)?))
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub fn close(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        // Drop runs next but finds the child already reaped.
    }
}

impl Drop for VideoReader {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Re-encode `input` into `output`, forwarding ffmpeg's own completion
/// percentage (0-100) to `on_progress`.
pub fn convert_video(
    input: &Path,
    output: &Path,
    mut on_progress: impl FnMut(f64),
) -> OverlayResult<()> {
    // Duration drives the percentage; containers without one (raw bitstreams)
    // still convert, just without intermediate progress.
    let duration_us = VideoContext::open(input)
        .map(|ctx| (ctx.duration_sec * 1e6) as i64)
        .unwrap_or(0);

    tracing::info!(input = %input.display(), output = %output.display(), "converting file");

    let mut child = Command::new("ffmpeg")
        .args(["-v", "error", "-y", "-i"])
        .arg(input)
        .args(["-progress", "pipe:1", "-nostats"])
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| OverlayError::subprocess(format!("failed to spawn ffmpeg: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| OverlayError::subprocess("failed to open ffmpeg stdout (unexpected)"))?;
    for line in BufReader::new(stdout).lines() {
        let line =
            line.map_err(|e| OverlayError::subprocess(format!("ffmpeg progress read: {e}")))?;
        if let Some(out_time_us) = parse_progress_line(&line) {
            if duration_us > 0 {
                let pct = (out_time_us as f64 / duration_us as f64 * 100.0).clamp(0.0, 100.0);
                on_progress(pct);
            }
        }
    }

    let out = child
        .wait_with_output()
        .map_err(|e| OverlayError::subprocess(format!("failed to wait for ffmpeg: {e}")))?;
    if !out.status.success() {
        return Err(OverlayError::subprocess(format!(
            "ffmpeg conversion of '{}' failed: {}",
            input.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    on_progress(100.0);
    tracing::info!("ffmpeg conversion finished");
    Ok(())
}

/// Extract the microsecond completion time from one `-progress pipe:1` line.
pub(crate) fn parse_progress_line(line: &str) -> Option<i64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => value.parse::<i64>().ok().filter(|v| *v >= 0),
        _ => None,
    }
}

pub(crate) fn parse_ff_ratio(s: &str) -> Option<(u32, u32)> {
    let mut parts = s.split('/');
    let a = parts.next()?.parse::<u32>().ok()?;
    let b = parts.next()?.parse::<u32>().ok()?;
    if b == 0 {
        return None;
    }
    Some((a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_parsing_handles_common_rates() {
        assert_eq!(parse_ff_ratio("30/1"), Some((30, 1)));
        assert_eq!(parse_ff_ratio("30000/1001"), Some((30000, 1001)));
        assert_eq!(parse_ff_ratio("0/0"), None);
        assert_eq!(parse_ff_ratio("abc"), None);
    }

    #[test]
    fn progress_lines_yield_out_time() {
        assert_eq!(parse_progress_line("out_time_us=1500000"), Some(1_500_000));
        assert_eq!(parse_progress_line("out_time_ms=1500000"), Some(1_500_000));
        assert_eq!(parse_progress_line("frame=10"), None);
        assert_eq!(parse_progress_line("progress=end"), None);
        // ffmpeg reports a sentinel negative value before the first packet.
        assert_eq!(parse_progress_line("out_time_us=-9223372036854775808"), None);
        assert_eq!(parse_progress_line("garbage"), None);
    }
}
