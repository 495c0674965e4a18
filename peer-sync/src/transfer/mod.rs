//! Streaming plumbing for uploads.

pub mod pipe;
pub mod progress;
pub mod progress_stream;

pub use pipe::{spawn_producer, BodyStream, ChannelWriter, Pipe};
pub use progress_stream::ProgressStream;
