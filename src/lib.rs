//! Low-latency shared-memory publish/subscribe.
//!
//! A [`Client`] talks to a media driver through a memory-mapped
//! command-and-control file: commands go over a many-to-one ring buffer,
//! responses come back on a broadcast buffer, and messages flow through
//! mapped log buffers that publications append to and subscriptions poll.
//! The crate also ships a [`MediaDriver`] for the `ipc` media that can be
//! embedded in the same process.

pub mod channel;
pub mod client;
pub mod clock;
pub mod cnc;
pub mod concurrent;
pub mod context;
pub mod driver;
pub mod error;
pub mod logbuffer;
pub mod protocol;

pub use channel::ChannelUri;
pub use client::buffer_claim::BufferClaim;
pub use client::counter::Counter;
pub use client::image::Image;
pub use client::publication::Publication;
pub use client::subscription::Subscription;
pub use client::Client;
pub use clock::{Clock, ManualClock, QuantaClock, SystemClock};
pub use concurrent::agent::{Agent, AgentInvoker, AgentRunner};
pub use concurrent::counters::{CounterHandle, CounterMetadata, CounterState, CountersReader};
pub use concurrent::idle::IdleStrategy;
pub use context::{Context, DriverContext, ThreadingMode};
pub use driver::MediaDriver;
pub use error::{Error, ErrorCode, ErrorHandler, Result};
pub use logbuffer::header::Header;
pub use logbuffer::reader::ControlledAction;
