pub mod config;
pub mod control_plane;
pub mod db;
pub mod delivery;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod models;
pub mod otp;
pub mod output;
pub mod queue;

pub use error::{EngineError, Result};
