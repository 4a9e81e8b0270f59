pub mod latest;
pub mod queue;
pub mod stream;

pub use latest::LatestFrame;
pub use queue::FrameQueue;
pub use stream::{FrameCallback, FrameStream, StreamPhase};
