//! Repeated bulb exposures on a dedicated thread

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, warn};

use super::cancel::CancelToken;
use crate::capture::camera::{Camera, ExposureId, ExposureRequest};
use crate::Result;

/// What a schedule does on every iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleParams {
    /// Bulb time of each exposure
    pub exposure: Duration,
    /// Download one exposure every `aux_interval`; `None` never downloads
    pub aux_interval: Option<Duration>,
    pub keep_on_camera: bool,
}

#[derive(Debug)]
struct ScheduleState {
    started_at: Instant,
    exposures: u64,
    last_aux: Option<Instant>,
    last_exposure: Option<ExposureId>,
    last_error: Option<String>,
    finished: bool,
}

/// Point-in-time view of a schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleStatus {
    pub exposures: u64,
    pub last_exposure: Option<ExposureId>,
    pub elapsed: Duration,
    pub since_last_download: Option<Duration>,
    pub interrupted: bool,
    /// The loop has exited, on interrupt or after a failed exposure
    pub finished: bool,
    pub last_error: Option<String>,
}

/// Result of a schedule that has been stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleSummary {
    pub exposures: u64,
    pub last_exposure: Option<ExposureId>,
    pub last_error: Option<String>,
}

/// Handle to a running schedule thread.
pub struct ScheduleTask {
    token: CancelToken,
    state: Arc<Mutex<ScheduleState>>,
    handle: JoinHandle<()>,
}

fn lock_state(state: &Mutex<ScheduleState>) -> MutexGuard<'_, ScheduleState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn lock_camera(camera_lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    camera_lock
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScheduleTask {
    /// Start the exposure loop. `camera_lock` serializes access to the body
    /// with single captures and setting changes.
    pub fn spawn(
        camera: Arc<dyn Camera>,
        camera_lock: Arc<Mutex<()>>,
        params: ScheduleParams,
    ) -> Result<Self> {
        let token = CancelToken::new();
        let state = Arc::new(Mutex::new(ScheduleState {
            started_at: Instant::now(),
            exposures: 0,
            last_aux: None,
            last_exposure: None,
            last_error: None,
            finished: false,
        }));

        let handle = {
            let token = token.clone();
            let state = Arc::clone(&state);
            thread::Builder::new()
                .name("astrocam-schedule".into())
                .spawn(move || {
                    run_schedule(camera.as_ref(), &camera_lock, params, &token, &state);
                    lock_state(&state).finished = true;
                })?
        };

        info!(?params, "Schedule started");
        Ok(Self {
            token,
            state,
            handle,
        })
    }

    pub fn status(&self) -> ScheduleStatus {
        let state = lock_state(&self.state);
        ScheduleStatus {
            exposures: state.exposures,
            last_exposure: state.last_exposure.clone(),
            elapsed: state.started_at.elapsed(),
            since_last_download: state.last_aux.map(|at| at.elapsed()),
            interrupted: self.token.is_cancelled(),
            finished: state.finished,
            last_error: state.last_error.clone(),
        }
    }

    /// Set the interrupt and wait for the loop to exit. An exposure in flight
    /// always completes first.
    pub fn stop(self) -> ScheduleSummary {
        info!("Exiting schedule after current exposure");
        self.token.cancel();
        if self.handle.join().is_err() {
            error!("Schedule thread panicked");
        }

        let state = lock_state(&self.state);
        info!(exposures = state.exposures, "Schedule stopped");
        ScheduleSummary {
            exposures: state.exposures,
            last_exposure: state.last_exposure.clone(),
            last_error: state.last_error.clone(),
        }
    }
}

fn run_schedule(
    camera: &dyn Camera,
    camera_lock: &Mutex<()>,
    params: ScheduleParams,
    token: &CancelToken,
    state: &Mutex<ScheduleState>,
) {
    {
        let _camera = lock_camera(camera_lock);
        if let Err(e) = camera.set_config("shutterspeed", "bulb") {
            error!(error = %e, "Could not switch camera to bulb");
            lock_state(state).last_error = Some(e.to_string());
            return;
        }
    }

    while !token.is_cancelled() {
        let download = {
            let mut guard = lock_state(state);
            let due = params.aux_interval.is_some_and(|interval| {
                guard.last_aux.map_or(true, |at| at.elapsed() >= interval)
            });
            if due {
                guard.last_aux = Some(Instant::now());
            }
            due
        };

        let request = ExposureRequest {
            bulb: Some(params.exposure),
            download,
            keep_on_camera: params.keep_on_camera,
        };

        let count = lock_state(state).exposures + 1;
        info!(count, download, "Exposure started");
        let result = {
            let _camera = lock_camera(camera_lock);
            camera.capture(&request)
        };

        let mut guard = lock_state(state);
        match result {
            Ok(id) => {
                guard.exposures = count;
                metrics::counter!("astrocam_exposures_total").increment(1);
                info!(count, file = %id, downloaded = download, "Exposure complete");
                guard.last_exposure = Some(id);
            }
            Err(e) => {
                warn!(count, error = %e, "Exposure failed, ending schedule");
                guard.last_error = Some(e.to_string());
                break;
            }
        }
    }
}
