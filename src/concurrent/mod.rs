//! Shared-memory primitives and the agent model built on top of them.

pub mod agent;
pub mod atomic_buffer;
pub mod broadcast;
pub mod counters;
pub mod idle;
pub mod mmap;
pub mod ring_buffer;

pub use agent::{Agent, AgentInvoker, AgentRunner};
pub use atomic_buffer::AtomicBuffer;
pub use broadcast::{BroadcastReceiver, BroadcastTransmitter, CopyBroadcastReceiver};
pub use counters::{
    AtomicCounter, CounterHandle, CounterMetadata, CounterState, CountersManager, CountersReader,
};
pub use idle::{IdleStrategy, Idler};
pub use mmap::MmapFile;
pub use ring_buffer::ManyToOneRingBuffer;
