pub mod config;
pub mod duration;

pub use config::ProvisorConfig;
pub use duration::{DurationError, parse_duration};
