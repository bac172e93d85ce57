//! Tape：会话录制与回放
//!
//! 录制为追加写的 NDJSON 事件流，回放时载入整个文件并在时间线上定位。

pub mod cost;
pub mod event;
pub mod loader;
pub mod playback;
pub mod recorder;
pub mod writer;

pub use cost::CostBreakdown;
pub use loader::Tape;
pub use playback::PlaybackClock;
pub use recorder::TapeRecorder;
pub use writer::TapeWriter;
