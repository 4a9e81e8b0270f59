//! Fakes shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use astrocam::capture::CommandSpec;
use astrocam::{Camera, Config, ExposureId, ExposureRequest, Result};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

/// Encode a solid-colour JPEG.
pub fn jpeg_bytes(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([shade, 255 - shade, shade / 2]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}

/// Write `count` concatenated frames to `path`.
pub fn write_mjpeg(path: &Path, count: usize) {
    let mut data = Vec::new();
    for i in 0..count {
        data.extend(jpeg_bytes(32, 24, (i * 60) as u8));
    }
    std::fs::write(path, data).unwrap();
}

/// Shell body that emits a file and then idles like a live-view process.
pub fn emit_then_idle(path: &Path) -> String {
    format!("cat '{}'; exec sleep 30", path.display())
}

/// Shell body that emits a file and exits, like a camera that hangs up.
pub fn emit_then_exit(path: &Path) -> String {
    format!("exec cat '{}'", path.display())
}

/// Shell body that ignores SIGTERM.
pub const STUBBORN: &str = "trap '' TERM; exec sleep 30";

/// Configuration with short timeouts and a single-read chunk size.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.stream.chunk_size = 64 * 1024;
    config.stream.graceful_timeout_ms = 300;
    config
}

/// Camera whose video process is a shell script and whose exposures sleep.
pub struct FakeCamera {
    pub program: String,
    pub script: Mutex<String>,
    pub ready: AtomicBool,
    pub exposure: Duration,
    pub ready_delay: Duration,
    pub download_delay: Duration,
    pub releases: AtomicUsize,
    pub captures: Mutex<Vec<ExposureRequest>>,
    pub values: Mutex<HashMap<String, String>>,
}

impl FakeCamera {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            program: "/bin/sh".into(),
            script: Mutex::new(script.into()),
            ready: AtomicBool::new(true),
            exposure: Duration::from_millis(10),
            ready_delay: Duration::ZERO,
            download_delay: Duration::ZERO,
            releases: AtomicUsize::new(0),
            captures: Mutex::new(Vec::new()),
            values: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_exposure(mut self, exposure: Duration) -> Self {
        self.exposure = exposure;
        self
    }

    pub fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = delay;
        self
    }

    pub fn with_download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = delay;
        self
    }

    pub fn missing_launcher() -> Self {
        let mut camera = Self::new("");
        camera.program = "/nonexistent/astrocam-video".into();
        camera
    }

    pub fn capture_count(&self) -> usize {
        self.captures.lock().unwrap().len()
    }
}

impl Camera for FakeCamera {
    fn is_ready(&self) -> Result<bool> {
        thread::sleep(self.ready_delay);
        Ok(self.ready.load(Ordering::SeqCst))
    }

    fn video_command(&self) -> CommandSpec {
        let script = self.script.lock().unwrap().clone();
        CommandSpec::new(self.program.clone(), ["-c".to_string(), script])
    }

    fn release(&self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn capture(&self, request: &ExposureRequest) -> Result<ExposureId> {
        thread::sleep(self.exposure);
        let mut captures = self.captures.lock().unwrap();
        captures.push(*request);
        Ok(ExposureId(format!("IMG_{:04}.CR3", captures.len())))
    }

    fn get_config(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn config_choices(&self, _key: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn download_latest(&self) -> Result<bool> {
        thread::sleep(self.download_delay);
        Ok(true)
    }

    fn sync_clock(&self) -> Result<()> {
        Ok(())
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
