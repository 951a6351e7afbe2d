pub mod config;
pub mod exec;
pub mod ffmpeg;
pub mod fs;
pub mod logging;
