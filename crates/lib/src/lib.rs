//! Lookout core library — photo-analysis pipeline, channels, storage, and
//! detector client used by the `lookout` binary.

pub mod bot;
pub mod channels;
pub mod config;
pub mod detector;
pub mod init;
pub mod labels;
pub mod predict;
pub mod records;
pub mod server;
pub mod storage;
