//! walb-engine: a block-level write-ahead-log virtualisation engine.
//!
//! Sits in front of a data device and a log device: writes land in the log
//! first as checksummed, salted log-packs, get acknowledged once durable
//! there, and are later copied ("redone") into their home location on the
//! data device at the engine's leisure. A crash between those two points is
//! recovered by replaying the log from the last checkpointed `oldest_lsid`
//! forward.
//!
//! The public surface is [`Engine`], opened over a pair of [`BlockDevice`]
//! implementations and an [`EngineConfig`]; [`testing::MemBlockDevice`] stands
//! in for real disks in tests.

mod checkpoint;
mod checksum;
mod clock;
mod config;
mod device;
mod engine;
mod entropy;
mod error;
mod lock;
mod logpack;
mod lsid;
mod pipeline;
mod pool;
mod redo;
mod ring;
mod sector;
mod snapshot;
mod superblock;

pub mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use device::BlockDevice;
pub use engine::Engine;
pub use entropy::{DeterministicEntropy, EntropySource};
pub use error::{Error, Result};
pub use snapshot::SnapshotRecord;
