//! Log buffers: three rotating term partitions plus a metadata trailer, the
//! frames written into them, and the readers that scan them.

pub mod appender;
pub mod assembler;
pub mod descriptor;
pub mod frame;
pub mod header;
pub mod log_buffers;
pub mod reader;

pub use appender::{Append, TermAppender};
pub use assembler::{FragmentAssembler, FragmentStatus};
pub use descriptor::LogMetadata;
pub use header::Header;
pub use log_buffers::LogBuffers;
pub use reader::{ControlledAction, ReadOutcome};
