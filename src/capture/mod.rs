pub mod camera;
pub mod decoder;
pub mod frame;
pub mod process;
pub mod settings;

pub use camera::{Camera, Gphoto2Camera};
pub use decoder::FrameAssembler;
pub use frame::Frame;
pub use frame::PixelFormat;
pub use process::{CommandSpec, ExternalProcess, Termination};
