//! Stream read loop: drains the relay socket, reassembles and decrypts
//! frames, and fans them out to the file sinks and the optional RTSP server.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::cloud::CloudClient;
use crate::rtsp::RtspServer;
use crate::stream::{decrypt_frame, demux::Demuxer, StreamKind};

/// Relay read chunk size.
const READ_CHUNK: usize = 64 * 1024;

/// Gap between progress log lines.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Cooperative stop flag shared with the interrupt handler.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Recording parameters for one invocation.
pub struct RecorderOptions {
    pub duration: Duration,
    pub output_dir: PathBuf,
    pub prefix: String,
    /// Record audio if the camera supports it.
    pub enable_audio: bool,
    /// Also dump the undecrypted relay stream for offline analysis.
    pub raw_dump: bool,
}

/// What a finished recording produced.
pub struct RecordingSummary {
    pub video_path: PathBuf,
    pub audio_path: Option<PathBuf>,
    pub video_bytes: u64,
    pub audio_bytes: u64,
    pub cancelled: bool,
}

/// Run the stream read loop until the duration expires, the user interrupts,
/// or the relay goes away.
///
/// Video is written as HEVC Annex-B to `<prefix>_<stamp>.h265` (and forwarded
/// to the RTSP fan-out when live streaming is on); audio as raw AAC frames to
/// `<prefix>_<stamp>.aac`.
pub async fn record(
    client: &CloudClient,
    opts: &RecorderOptions,
    rtsp: Option<Arc<RtspServer>>,
    cancel: CancelToken,
) -> Result<RecordingSummary> {
    let session = client.session().context("not logged in")?;
    let key = *session.key();
    let mut relay = client.open_stream().await?;

    fs::create_dir_all(&opts.output_dir).with_context(|| {
        format!("failed to create output directory {}", opts.output_dir.display())
    })?;
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let base = opts.output_dir.join(format!("{}_{}", opts.prefix, stamp));

    let video_path = base.with_extension("h265");
    let mut video_file = File::create(&video_path)
        .with_context(|| format!("failed to create {}", video_path.display()))?;
    tracing::info!("recording video to {}", video_path.display());

    let record_audio = opts.enable_audio && client.audio_supported();
    let audio_path = record_audio.then(|| base.with_extension("aac"));
    let mut audio_file = match &audio_path {
        Some(path) => {
            tracing::info!("recording audio to {}", path.display());
            Some(File::create(path).with_context(|| format!("failed to create {}", path.display()))?)
        }
        None => {
            if opts.enable_audio {
                tracing::info!("audio: not supported by camera");
            } else {
                tracing::info!("audio: disabled");
            }
            None
        }
    };

    let mut raw_file = if opts.raw_dump {
        let path = base.with_extension("raw.bin");
        tracing::info!("saving raw stream to {}", path.display());
        Some(File::create(&path).with_context(|| format!("failed to create {}", path.display()))?)
    } else {
        None
    };

    let mut demux = Demuxer::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut video_bytes = 0u64;
    let mut audio_bytes = 0u64;
    let deadline = Instant::now() + opts.duration;
    let start = Instant::now();
    let mut last_progress = Instant::now();
    let mut cancelled = false;

    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            tracing::info!("stop requested, closing stream");
            cancelled = true;
            break;
        }

        let n = match relay.read(&mut buf).await? {
            // Quiet socket; keepalive already sent, try again.
            None => continue,
            Some(0) => {
                tracing::info!("relay closed the connection");
                break;
            }
            Some(n) => n,
        };

        if let Some(raw) = raw_file.as_mut() {
            raw.write_all(&buf[..n]).context("raw dump write failed")?;
        }

        demux.extend(&buf[..n]);
        for mut frame in demux.drain() {
            decrypt_frame(&key, &mut frame);
            match frame.kind {
                StreamKind::Audio => {
                    if let Some(audio) = audio_file.as_mut() {
                        audio.write_all(&frame.data).context("audio write failed")?;
                        audio_bytes += frame.data.len() as u64;
                    }
                }
                _ => {
                    video_file.write_all(&frame.data).context("video write failed")?;
                    video_bytes += frame.data.len() as u64;
                    if let Some(server) = &rtsp {
                        server.send_frame(&frame.data).await;
                    }
                }
            }
        }

        relay.tick_keepalive().await?;

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            tracing::info!(
                "{}s elapsed - video {:.1} KiB, audio {:.1} KiB",
                start.elapsed().as_secs(),
                video_bytes as f64 / 1024.0,
                audio_bytes as f64 / 1024.0
            );
            last_progress = Instant::now();
        }
    }

    // A complete frame left open gets flushed; partial assemblies are dropped.
    if let Some(mut frame) = demux.finish() {
        decrypt_frame(&key, &mut frame);
        if frame.kind.is_video() {
            video_file.write_all(&frame.data).context("video write failed")?;
            video_bytes += frame.data.len() as u64;
        }
    }
    if demux.dropped() > 0 {
        tracing::debug!("{} incomplete frames dropped", demux.dropped());
    }

    video_file.flush()?;
    if let Some(audio) = audio_file.as_mut() {
        audio.flush()?;
    }

    tracing::info!(
        "recording {} - video {:.1} KiB, audio {:.1} KiB",
        if cancelled { "stopped by user" } else { "complete" },
        video_bytes as f64 / 1024.0,
        audio_bytes as f64 / 1024.0
    );

    Ok(RecordingSummary {
        video_path,
        audio_path,
        video_bytes,
        audio_bytes,
        cancelled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
