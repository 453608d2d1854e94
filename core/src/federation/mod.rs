//! Federation-level runtime: configuration, the locked engine, checkpoints

pub mod checkpoint;
pub mod config;
pub mod engine;

pub use checkpoint::{compute_config_hash, validate_snapshot, CheckpointError, TimeSnapshot};
pub use config::{ConfigError, RegulationBarrier, TimeConfig};
pub use engine::{
    Broadcaster, Federation, NullBroadcaster, Published, RecordingBroadcaster, RequestDisposition,
};
