pub mod cancel;
pub mod controller;
pub mod mode;
pub mod schedule;

pub use cancel::CancelToken;
pub use controller::CaptureController;
pub use mode::{ModeGuard, ModeLease, OperatingMode};
pub use schedule::{ScheduleStatus, ScheduleSummary};
