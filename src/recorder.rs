//! Best-effort video capture for a job's page, bridging Playwright's
//! native `record_video_dir` (what `original_source/app/video_service.py`'s
//! callers assume) onto chromiumoxide, which only speaks raw CDP.
//!
//! Frames come in over `Page.screencastFrame`, get acked immediately (the
//! browser stalls the cast otherwise), and are written out as numbered
//! JPEGs into a scratch directory. `finalize` shells out to `ffmpeg` to mux
//! them into a single `.webm`. Per §4.5's recording-recovery rule, a mux
//! failure is logged and swallowed — the caller gets `None` and proceeds
//! with a null `video_path`, never a hard error.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use base64::Engine;
use chromiumoxide::cdp::browser_protocol::page::{
    EventScreencastFrame, ScreencastFrameAckParams, StartScreencastFormat, StartScreencastParams,
    StopScreencastParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const FRAME_RATE_FPS: u32 = 8;

pub struct Recorder {
    page: Arc<Page>,
    frame_dir: PathBuf,
    frame_count: Arc<AtomicU32>,
    listener: JoinHandle<()>,
}

impl Recorder {
    /// Starts the screencast and spawns the frame-writer task. `frame_dir`
    /// must already exist; it's removed by `finalize`/`abort`.
    pub async fn start(page: Arc<Page>, frame_dir: PathBuf) -> Result<Self, chromiumoxide::error::CdpError> {
        let mut events = page.event_listener::<EventScreencastFrame>().await?;
        let frame_count = Arc::new(AtomicU32::new(0));

        page.execute(
            StartScreencastParams::builder()
                .format(StartScreencastFormat::Jpeg)
                .every_nth_frame(1)
                .build(),
        )
        .await?;

        let writer_page = page.clone();
        let writer_dir = frame_dir.clone();
        let writer_count = frame_count.clone();
        let listener = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let index = writer_count.fetch_add(1, Ordering::SeqCst);
                let path = writer_dir.join(format!("frame-{:06}.jpg", index));
                match base64::engine::general_purpose::STANDARD.decode(&event.data) {
                    Ok(bytes) => {
                        if let Err(e) = tokio::fs::write(&path, &bytes).await {
                            warn!(error = %e, "failed to write screencast frame");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to decode screencast frame"),
                }
                let ack = ScreencastFrameAckParams::builder()
                    .session_id(event.session_id)
                    .build()
                    .expect("session_id is always set by the browser");
                if let Err(e) = writer_page.execute(ack).await {
                    debug!(error = %e, "failed to ack screencast frame");
                }
            }
        });

        Ok(Self {
            page,
            frame_dir,
            frame_count,
            listener,
        })
    }

    /// Stops the cast and muxes whatever frames were captured into `dest`.
    /// Returns `None` (never an error) if nothing was captured or `ffmpeg`
    /// isn't available — the caller treats that as "no recording".
    pub async fn finalize(self, dest: &Path) -> Option<u64> {
        let _ = self.page.execute(StopScreencastParams::builder().build()).await;
        self.listener.abort();

        let captured = self.frame_count.load(Ordering::SeqCst);
        if captured == 0 {
            let _ = tokio::fs::remove_dir_all(&self.frame_dir).await;
            return None;
        }

        if let Some(parent) = dest.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(error = %e, "failed to create video destination directory");
                let _ = tokio::fs::remove_dir_all(&self.frame_dir).await;
                return None;
            }
        }

        let pattern = self.frame_dir.join("frame-%06d.jpg");
        let output = tokio::process::Command::new("ffmpeg")
            .arg("-y")
            .arg("-framerate")
            .arg(FRAME_RATE_FPS.to_string())
            .arg("-i")
            .arg(&pattern)
            .args(["-c:v", "libvpx-vp9", "-pix_fmt", "yuv420p"])
            .arg(dest)
            .output()
            .await;

        let _ = tokio::fs::remove_dir_all(&self.frame_dir).await;

        match output {
            Ok(result) if result.status.success() => tokio::fs::metadata(dest)
                .await
                .map(|m| m.len())
                .ok(),
            Ok(result) => {
                warn!(
                    stderr = %String::from_utf8_lossy(&result.stderr),
                    "ffmpeg mux failed, dropping recording"
                );
                None
            }
            Err(e) => {
                warn!(error = %e, "failed to invoke ffmpeg, dropping recording");
                None
            }
        }
    }

    /// Used on the panic/cancellation path: stop casting and discard
    /// whatever was captured without trying to mux it.
    pub async fn abort(self) {
        let _ = self.page.execute(StopScreencastParams::builder().build()).await;
        self.listener.abort();
        let _ = tokio::fs::remove_dir_all(&self.frame_dir).await;
    }
}
