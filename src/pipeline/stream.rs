//! Live-view stream: owns the video process and a reader thread that turns
//! its MJPEG output into frames for any number of consumers.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use super::latest::LatestFrame;
use super::queue::{FrameQueue, QueueStats};
use crate::capture::camera::Camera;
use crate::capture::decoder::FrameAssembler;
use crate::capture::process::{ExternalProcess, ProcessOutput};
use crate::{Error, Frame, Result, StreamConfig};

/// Consumer invoked on the reader thread for every decoded frame.
pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub bytes_read: u64,
    pub frames_decoded: u64,
    pub callback_failures: u64,
    pub queue: QueueStats,
}

/// Guarded by the state lock; never held across a blocking wait.
struct StreamState {
    phase: StreamPhase,
    process: Option<ExternalProcess>,
    reader: Option<JoinHandle<()>>,
}

/// Everything the reader thread publishes into.
struct Shared {
    running: AtomicBool,
    queue: FrameQueue,
    latest: LatestFrame,
    callbacks: RwLock<Vec<FrameCallback>>,
    bytes_read: AtomicU64,
    frames_decoded: AtomicU64,
    callback_failures: AtomicU64,
}

pub struct FrameStream {
    camera: Arc<dyn Camera>,
    config: StreamConfig,
    state: Mutex<StreamState>,
    shared: Arc<Shared>,
}

impl FrameStream {
    pub fn new(camera: Arc<dyn Camera>, config: StreamConfig) -> Self {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(false),
            queue: FrameQueue::new(config.queue_capacity),
            latest: LatestFrame::new(),
            callbacks: RwLock::new(Vec::new()),
            bytes_read: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            callback_failures: AtomicU64::new(0),
        });

        Self {
            camera,
            config,
            state: Mutex::new(StreamState {
                phase: StreamPhase::Stopped,
                process: None,
                reader: None,
            }),
            shared,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, StreamState> {
        // Every field is replaced wholesale, so a poisoned lock still holds
        // consistent data.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Launch the video process and the reader thread. Succeeds immediately
    /// if the stream is already running.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        if check_phase(self.lock_state().phase)? {
            return Ok(());
        }

        // The readiness query shells out, so it runs without the state lock
        // and the phase is checked again afterwards.
        let ready = self.camera.is_ready()?;

        let mut state = self.lock_state();
        if check_phase(state.phase)? {
            return Ok(());
        }
        if !ready {
            return Err(Error::DeviceUnavailable(
                "camera turned off or not connected".into(),
            ));
        }

        info!("Starting camera stream...");
        state.phase = StreamPhase::Starting;
        self.shared.latest.clear();
        self.shared.queue.clear();

        match self.launch() {
            Ok((process, reader)) => {
                state.process = Some(process);
                state.reader = Some(reader);
                state.phase = StreamPhase::Running;
                info!("Camera stream started");
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                state.phase = StreamPhase::Stopped;
                error!(error = %e, "Stream failed to start");
                Err(e)
            }
        }
    }

    fn launch(&self) -> Result<(ExternalProcess, JoinHandle<()>)> {
        let mut process = ExternalProcess::new(self.camera.video_command());
        process.start()?;

        let Some(output) = process.take_output() else {
            self.abort(&mut process);
            return Err(Error::ProcessStart {
                program: process.spec().program.clone(),
                source: io::Error::other("stdout not captured"),
            });
        };

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let spawned = thread::Builder::new()
            .name("astrocam-reader".into())
            .spawn(move || read_loop(&shared, output, &config));

        match spawned {
            Ok(reader) => Ok((process, reader)),
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                self.abort(&mut process);
                Err(e.into())
            }
        }
    }

    fn abort(&self, process: &mut ExternalProcess) {
        if let Err(e) = process.terminate(self.config.graceful_timeout()) {
            error!(error = %e, "Failed to terminate capture process");
        }
    }

    /// Stop the reader and the video process. A no-op unless running.
    #[instrument(skip(self))]
    pub fn stop(&self) {
        let (process, reader) = {
            let mut state = self.lock_state();
            if state.phase != StreamPhase::Running {
                return;
            }

            info!("Stopping camera stream...");
            self.shared.running.store(false, Ordering::Release);
            state.phase = StreamPhase::Stopping;
            (state.process.take(), state.reader.take())
        };

        // Outside the lock: terminating can take the whole grace period and
        // the join waits on a thread that must not contend with callers.
        if let Some(mut process) = process {
            match process.terminate(self.config.graceful_timeout()) {
                Ok(outcome) => debug!(?outcome, "Capture process ended"),
                Err(e) => error!(error = %e, "Failed to terminate capture process"),
            }
            if let Err(e) = self.camera.release() {
                warn!(error = %e, "Camera release failed");
            }
        }

        if let Some(reader) = reader {
            if reader.join().is_err() {
                error!("Stream reader thread panicked");
            }
        }

        self.lock_state().phase = StreamPhase::Stopped;
        info!("Camera stream stopped");
    }

    /// Next queued frame, waiting at most `timeout`.
    pub fn get_frame(&self, timeout: Duration) -> Option<Frame> {
        self.shared.queue.pop_timeout(timeout)
    }

    /// Most recent frame without consuming it; `None` while not running.
    pub fn get_latest_frame(&self) -> Option<Frame> {
        if !self.is_running() {
            return None;
        }
        self.shared.latest.get()
    }

    /// Register a consumer for every frame. Returns the number registered.
    pub fn register_frame_callback<F>(&self, callback: F) -> usize
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        let mut callbacks = self
            .shared
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        callbacks.push(Arc::new(callback));
        callbacks.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> StreamPhase {
        self.lock_state().phase
    }

    /// Pid of the video process while one is owned by the stream.
    pub fn process_id(&self) -> Option<u32> {
        self.lock_state().process.as_ref().and_then(ExternalProcess::id)
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            bytes_read: self.shared.bytes_read.load(Ordering::Relaxed),
            frames_decoded: self.shared.frames_decoded.load(Ordering::Relaxed),
            callback_failures: self.shared.callback_failures.load(Ordering::Relaxed),
            queue: self.shared.queue.stats(),
        }
    }
}

/// `Ok(true)` if already running, an error while another start or stop is
/// in progress.
fn check_phase(phase: StreamPhase) -> Result<bool> {
    match phase {
        StreamPhase::Running => {
            info!("Stream already running");
            Ok(true)
        }
        StreamPhase::Starting | StreamPhase::Stopping => Err(Error::DeviceUnavailable(
            "previous stream is still shutting down".into(),
        )),
        StreamPhase::Stopped => Ok(false),
    }
}

fn read_loop(shared: &Shared, mut output: ProcessOutput, config: &StreamConfig) {
    let mut assembler = FrameAssembler::new(config.min_frame_bytes, config.max_buffer_bytes);

    while shared.running.load(Ordering::Acquire) {
        let chunk = match output.read(config.chunk_size) {
            Ok(chunk) if chunk.is_empty() => {
                if shared.running.load(Ordering::Acquire) {
                    warn!("Capture process closed its output");
                }
                break;
            }
            Ok(chunk) => chunk,
            Err(e) => {
                if shared.running.load(Ordering::Acquire) {
                    error!(error = %e, "Stream reading error");
                }
                break;
            }
        };

        shared
            .bytes_read
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        assembler.push(&chunk);
        while let Some(frame) = assembler.next_frame() {
            shared.publish(frame);
        }
    }

    debug!(skipped = assembler.skipped(), "Reader loop exited");
}

impl Shared {
    fn publish(&self, frame: Frame) {
        self.latest.publish(frame.clone());
        self.queue.push(frame.clone());
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("astrocam_frames_decoded_total").increment(1);

        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for callback in &callbacks {
            let frame = frame.clone();
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| callback(frame))) {
                self.callback_failures.fetch_add(1, Ordering::Relaxed);
                error!(reason = panic_message(panic.as_ref()), "Frame callback error");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
