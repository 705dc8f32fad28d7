pub mod bitmap;
pub mod compare;
pub mod group;
pub mod pipeline;
pub mod pixel;
pub mod task;

pub use compare::{compare, CompareError};
pub use pipeline::{ComparisonSet, FramePipeline, MatchError, Pair};
pub use pixel::{MatchResult, PixelGrid, Rgba};
pub use task::{FrameJob, FrameProcess, FrameTask, OutputFormat, TaskError};
