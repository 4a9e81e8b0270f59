//! Single entry point for the camera: live view, single captures, scheduled
//! bulb runs and settings, with the operating mode enforced between them.

use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::mode::{ModeGuard, OperatingMode};
use super::schedule::{lock_camera, ScheduleParams, ScheduleStatus, ScheduleSummary, ScheduleTask};
use crate::capture::camera::{Camera, ExposureId, ExposureRequest};
use crate::capture::settings::{Setting, SettingEntry, SettingValue, Settings};
use crate::pipeline::stream::FrameStream;
use crate::{Config, Error, Frame, Result};

pub struct CaptureController {
    camera: Arc<dyn Camera>,
    stream: FrameStream,
    mode: ModeGuard,
    settings: Settings,
    /// Serializes every command that talks to the camera body.
    camera_lock: Arc<Mutex<()>>,
    /// Held across start/stop sequences and idle-only camera commands. Mode
    /// entries only ever `try_lock` it, so they fail instead of queueing.
    lifecycle: Mutex<()>,
    schedule: Mutex<Option<ScheduleTask>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CaptureController {
    pub fn new(camera: Arc<dyn Camera>, config: &Config) -> Self {
        Self {
            stream: FrameStream::new(Arc::clone(&camera), config.stream.clone()),
            settings: Settings::new(Arc::clone(&camera), config.schedule.clone()),
            camera,
            mode: ModeGuard::new(),
            camera_lock: Arc::new(Mutex::new(())),
            lifecycle: Mutex::new(()),
            schedule: Mutex::new(None),
        }
    }

    pub fn stream(&self) -> &FrameStream {
        &self.stream
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode.current()
    }

    /// Lifecycle lock for entering `requested`. Contention means another
    /// command owns the camera right now.
    fn try_lifecycle(&self, requested: OperatingMode) -> Result<MutexGuard<'_, ()>> {
        match self.lifecycle.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => match self.mode.current() {
                OperatingMode::Idle => Err(Error::DeviceUnavailable(
                    "camera busy with another command".into(),
                )),
                active => Err(Error::ModeConflict { requested, active }),
            },
        }
    }

    /// Enter live view and start streaming. Fails with a mode conflict while
    /// a schedule runs or live view is already on.
    #[instrument(skip(self))]
    pub fn start_stream(&self) -> Result<()> {
        let _lifecycle = self.try_lifecycle(OperatingMode::LiveView)?;
        let lease = self.mode.acquire(OperatingMode::LiveView)?;
        self.stream.start()?;
        lease.keep();
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn stop_stream(&self) -> Result<()> {
        let _lifecycle = lock(&self.lifecycle);
        if self.mode.current() != OperatingMode::LiveView {
            return Err(Error::NotRunning("live stream"));
        }
        self.stream.stop();
        self.mode.leave(OperatingMode::LiveView);
        Ok(())
    }

    pub fn get_latest_frame(&self) -> Option<Frame> {
        self.stream.get_latest_frame()
    }

    pub fn get_frame(&self, timeout: Duration) -> Option<Frame> {
        self.stream.get_frame(timeout)
    }

    pub fn register_frame_callback<F>(&self, callback: F) -> usize
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        self.stream.register_frame_callback(callback)
    }

    /// One exposure with the current settings. Uses the session bulb time
    /// when the shutter is set to bulb.
    #[instrument(skip(self))]
    pub fn capture_once(&self) -> Result<ExposureId> {
        let _lifecycle = lock(&self.lifecycle);
        self.mode.ensure_idle(OperatingMode::Idle)?;

        let session = self.settings.session();
        let _camera = lock_camera(&self.camera_lock);
        let bulb = match self.camera.get_config("shutterspeed")? {
            Some(shutter) if shutter.eq_ignore_ascii_case("bulb") => Some(session.bulb_duration()),
            _ => None,
        };

        let request = ExposureRequest {
            bulb,
            download: session.download_to_host,
            keep_on_camera: session.keep_on_camera,
        };
        let id = self.camera.capture(&request)?;
        info!(file = %id, "Single capture complete");
        Ok(id)
    }

    /// Begin repeated bulb exposures of `exposure`, downloading one every
    /// `aux_interval` if given.
    #[instrument(skip(self))]
    pub fn start_schedule(
        &self,
        exposure: Duration,
        aux_interval: Option<Duration>,
    ) -> Result<()> {
        // The camera times bulb exposures in whole seconds.
        if exposure.as_secs() == 0 || exposure.subsec_nanos() != 0 {
            return Err(Error::InvalidSetting {
                setting: Setting::BulbDuration.name().to_string(),
                message: format!("{exposure:?} is not a whole number of seconds"),
            });
        }

        let _lifecycle = self.try_lifecycle(OperatingMode::ScheduledCapture)?;
        let lease = self.mode.acquire(OperatingMode::ScheduledCapture)?;
        let params = ScheduleParams {
            exposure,
            aux_interval,
            keep_on_camera: self.settings.session().keep_on_camera,
        };
        let task = ScheduleTask::spawn(
            Arc::clone(&self.camera),
            Arc::clone(&self.camera_lock),
            params,
        )?;
        *lock(&self.schedule) = Some(task);
        lease.keep();
        Ok(())
    }

    /// [`Self::start_schedule`] with the session bulb time and interval.
    pub fn start_schedule_from_settings(&self) -> Result<()> {
        let session = self.settings.session();
        self.start_schedule(session.bulb_duration(), session.download_interval())
    }

    /// Interrupt the schedule and block until the exposure in flight ends.
    /// The mode stays `ScheduledCapture` until then, so other modes keep
    /// failing fast.
    #[instrument(skip(self))]
    pub fn stop_schedule(&self) -> Result<ScheduleSummary> {
        let task = {
            let _lifecycle = lock(&self.lifecycle);
            lock(&self.schedule).take()
        };
        let Some(task) = task else {
            return Err(Error::NotRunning("schedule"));
        };

        let summary = task.stop();
        self.mode.leave(OperatingMode::ScheduledCapture);
        Ok(summary)
    }

    pub fn schedule_status(&self) -> Option<ScheduleStatus> {
        lock(&self.schedule).as_ref().map(ScheduleTask::status)
    }

    pub fn get_setting(&self, setting: Setting) -> Result<SettingValue> {
        let _camera = setting.camera_key().map(|_| lock_camera(&self.camera_lock));
        self.settings.get(setting)
    }

    /// Parse `raw` for `setting` and apply it.
    pub fn set_setting(&self, setting: Setting, raw: &str) -> Result<()> {
        let value = setting.parse_value(raw)?;
        let _camera = setting.camera_key().map(|_| lock_camera(&self.camera_lock));
        self.settings.set(setting, value)?;
        info!(%setting, value = raw, "Setting updated");
        Ok(())
    }

    pub fn setting_options(&self, setting: Setting) -> Result<Option<Vec<String>>> {
        let _camera = setting.camera_key().map(|_| lock_camera(&self.camera_lock));
        self.settings.options(setting)
    }

    pub fn settings_snapshot(&self) -> Result<Vec<SettingEntry>> {
        let _camera = lock_camera(&self.camera_lock);
        self.settings.snapshot()
    }

    /// Fetch the newest file from the card. Only allowed while idle.
    pub fn download_latest(&self) -> Result<bool> {
        let _lifecycle = lock(&self.lifecycle);
        self.mode.ensure_idle(OperatingMode::Idle)?;
        let _camera = lock_camera(&self.camera_lock);
        self.camera.download_latest()
    }

    pub fn sync_clock(&self) -> Result<()> {
        let _lifecycle = lock(&self.lifecycle);
        self.mode.ensure_idle(OperatingMode::Idle)?;
        let _camera = lock_camera(&self.camera_lock);
        self.camera.sync_clock()
    }

    /// Stop whatever is running and return to idle.
    pub fn shutdown(&self) {
        match self.mode.current() {
            OperatingMode::LiveView => {
                if let Err(e) = self.stop_stream() {
                    warn!(error = %e, "Stream stop during shutdown failed");
                }
            }
            OperatingMode::ScheduledCapture => match self.stop_schedule() {
                Ok(summary) => info!(exposures = summary.exposures, "Schedule ended"),
                Err(e) => warn!(error = %e, "Schedule stop during shutdown failed"),
            },
            OperatingMode::Idle => {}
        }
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
