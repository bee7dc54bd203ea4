pub mod cmd;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod duplicates;
mod error;
pub mod ffmpeg;
pub mod history;
pub mod manager;
pub mod metadata;
pub mod paths;
pub mod presets;
pub mod progress;
pub mod reconcile;
pub mod tools;
pub mod worker;

pub use error::{EngineError, Result};
