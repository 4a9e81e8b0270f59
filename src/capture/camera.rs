//! Camera control over the gphoto2 command line tool

use std::io::Write;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::process::{run_with_timeout, CommandSpec};
use crate::utils::{parse_auto_detect, FoundDevice};
use crate::{CameraConfig, Error, Result};

/// Extensions recognised as exposure files in CLI output
const IMAGE_EXTENSIONS: &[&str] = &[
    "cr3", "cr2", "nef", "arw", "raf", "orf", "rw2", "dng", "jpg", "jpeg",
];

/// Name of the file an exposure produced, e.g. `IMG_0042.CR3`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExposureId(pub String);

impl std::fmt::Display for ExposureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters for a single exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureRequest {
    /// Hold the shutter open for this long, rounded up to whole seconds.
    /// `None` uses the camera's own shutter speed.
    pub bulb: Option<Duration>,
    /// Transfer the file to the host after the exposure
    pub download: bool,
    /// Leave the file on the memory card
    pub keep_on_camera: bool,
}

/// Everything the capture core needs from the physical camera.
///
/// Implementations must be safe to call from several threads; the controller
/// serializes calls that touch the shutter.
pub trait Camera: Send + Sync {
    /// Whether a camera is connected and answering.
    fn is_ready(&self) -> Result<bool>;

    /// Command that streams live-view MJPEG on stdout until terminated.
    fn video_command(&self) -> CommandSpec;

    /// Return the camera to a usable state after the video process ended.
    fn release(&self) -> Result<()>;

    /// Take one exposure and return the file it produced. Blocks for the
    /// whole exposure.
    fn capture(&self, request: &ExposureRequest) -> Result<ExposureId>;

    fn get_config(&self, key: &str) -> Result<Option<String>>;

    fn set_config(&self, key: &str, value: &str) -> Result<()>;

    /// Allowed values for a config key, empty if the camera lists none.
    fn config_choices(&self, key: &str) -> Result<Vec<String>>;

    /// Fetch the newest file on the card. `Ok(false)` if it was already on
    /// the host.
    fn download_latest(&self) -> Result<bool>;

    /// Set the camera clock to host time.
    fn sync_clock(&self) -> Result<()>;
}

/// [`Camera`] backed by the `gphoto2` CLI.
pub struct Gphoto2Camera {
    config: CameraConfig,
}

impl Gphoto2Camera {
    pub fn new(config: CameraConfig) -> Self {
        Self { config }
    }

    fn spec<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(self.config.program.clone(), args)
    }

    /// Run gphoto2 to completion and return its stdout.
    fn run(&self, args: &[String]) -> Result<String> {
        self.run_with_input(args, None)
    }

    fn run_with_input(&self, args: &[String], input: Option<&str>) -> Result<String> {
        let spec = self.spec(args.iter().cloned());
        debug!(command = %spec, "Running camera command");

        let mut child = spec
            .command()
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::ProcessStart {
                program: spec.program.clone(),
                source,
            })?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(input.as_bytes())?;
        }

        let output = child.wait_with_output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(Error::Command {
                command: spec.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(stdout)
    }

    /// Connected cameras as reported by `--auto-detect`.
    pub fn detect(&self) -> Result<Vec<FoundDevice>> {
        let output = self.run(&["--auto-detect".to_string()])?;
        Ok(parse_auto_detect(&output))
    }
}

impl Camera for Gphoto2Camera {
    fn is_ready(&self) -> Result<bool> {
        let devices = self.detect()?;
        if let Some(device) = devices.first() {
            debug!(model = %device.model, port = %device.port, "Camera detected");
        }
        Ok(!devices.is_empty())
    }

    fn video_command(&self) -> CommandSpec {
        self.spec(["--capture-movie", "--stdout"])
    }

    #[instrument(skip(self))]
    fn release(&self) -> Result<()> {
        let spec = self.spec(["--set-config", "eosremoterelease=Release Full"]);
        let status = run_with_timeout(&spec, self.config.reset_timeout())?;
        if !status.success() {
            return Err(Error::Command {
                command: spec.to_string(),
                message: format!("exited with {status}"),
            });
        }
        info!("Camera released");
        Ok(())
    }

    #[instrument(skip(self))]
    fn capture(&self, request: &ExposureRequest) -> Result<ExposureId> {
        let args = exposure_args(request);
        let output = self.run(&args)?;
        parse_exposure_id(&output).ok_or_else(|| Error::Command {
            command: format!("{} {}", self.config.program, args.join(" ")),
            message: "no image file in output".to_string(),
        })
    }

    fn get_config(&self, key: &str) -> Result<Option<String>> {
        let output = self.run(&[format!("--get-config={key}")])?;
        Ok(parse_current(&output))
    }

    fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.run(&["--set-config".to_string(), format!("{key}={value}")])?;
        info!(key, value, "Camera setting changed");
        Ok(())
    }

    fn config_choices(&self, key: &str) -> Result<Vec<String>> {
        let output = self.run(&[format!("--get-config={key}")])?;
        Ok(parse_choices(&output))
    }

    fn download_latest(&self) -> Result<bool> {
        let listing = self.run(&["--list-files".to_string()])?;
        let Some(number) = parse_latest_file_number(&listing) else {
            warn!("No files on camera");
            return Ok(false);
        };

        // Answer "no" to both overwrite prompts so existing files are kept.
        let output = self.run_with_input(
            &["--get-file".to_string(), number.clone()],
            Some("n\nn\n"),
        )?;
        let saved = output.split_whitespace().next() == Some("Saving");
        info!(file = %number, saved, "Downloaded latest file");
        Ok(saved)
    }

    fn sync_clock(&self) -> Result<()> {
        self.run(&["--set-config".to_string(), "datetimeutc=now".to_string()])?;
        Ok(())
    }
}

/// gphoto2 arguments for one exposure.
pub fn exposure_args(request: &ExposureRequest) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    match request.bulb {
        Some(duration) => {
            args.extend(["--set-config".into(), "shutterspeed=bulb".into()]);
            if request.keep_on_camera {
                args.push("--keep".into());
            }
            args.extend([
                "--set-config".into(),
                "eosremoterelease=Immediate".into(),
                format!("--wait-event={}s", bulb_seconds(duration)),
                "--set-config".into(),
                "eosremoterelease=Release Full".into(),
            ]);
            args.push(if request.download {
                "--wait-event-and-download=2s".into()
            } else {
                "--wait-event=2s".into()
            });
        }
        None => {
            args.push(if request.download {
                "--capture-image-and-download".into()
            } else {
                "--capture-image".into()
            });
            if request.keep_on_camera {
                args.push("--keep".into());
            }
        }
    }
    args
}

/// Bulb time in whole seconds, rounded up and at least one.
pub fn bulb_seconds(duration: Duration) -> u64 {
    let whole = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    whole.max(1)
}

/// Last image file name mentioned in CLI output.
pub fn parse_exposure_id(output: &str) -> Option<ExposureId> {
    output
        .split_whitespace()
        .map(|token| token.trim_matches(|c: char| c == '\'' || c == '"' || c == ','))
        .filter_map(|token| token.rsplit('/').next())
        .filter(|name| {
            name.rsplit_once('.').is_some_and(|(stem, ext)| {
                !stem.is_empty() && IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
            })
        })
        .last()
        .map(|name| ExposureId(name.to_string()))
}

/// Value of the `Current:` line of `--get-config` output.
pub fn parse_current(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Current:"))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Values of the `Choice: N value` lines of `--get-config` output.
pub fn parse_choices(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Choice:"))
        .filter_map(|rest| {
            let (_index, value) = rest.trim().split_once(char::is_whitespace)?;
            Some(value.trim().to_string())
        })
        .collect()
}

/// Number of the last `#N name ...` line of `--list-files` output.
pub fn parse_latest_file_number(listing: &str) -> Option<String> {
    listing
        .lines()
        .filter(|line| line.starts_with('#'))
        .last()
        .and_then(|line| line.split_whitespace().next())
        .map(|token| token.trim_start_matches('#').to_string())
        .filter(|number| !number.is_empty())
}
