use std::io;

use crate::control::mode::OperatingMode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The capture launcher is missing or could not be spawned.
    #[error("failed to start `{program}`: {source}")]
    ProcessStart {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The camera reported it is not ready. Callers may retry later.
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("cannot enter {requested}: {}", conflict_reason(.requested, .active))]
    ModeConflict {
        requested: OperatingMode,
        active: OperatingMode,
    },

    #[error("{0} is not running")]
    NotRunning(&'static str),

    /// A camera CLI invocation failed or produced output we could not use.
    #[error("camera command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("unknown setting `{0}`")]
    UnknownSetting(String),

    #[error("invalid value for `{setting}`: {message}")]
    InvalidSetting { setting: String, message: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

fn conflict_reason(requested: &OperatingMode, active: &OperatingMode) -> String {
    if requested == active {
        "already running".to_string()
    } else {
        format!("stop {active} first")
    }
}
