#![forbid(unsafe_code)]

// lecture-sfu library - session orchestration and signaling for live lectures

pub mod attendance;
pub mod config;
pub mod error;
pub mod media;
pub mod metrics;
pub mod registry;
pub mod room;
pub mod signaling;
