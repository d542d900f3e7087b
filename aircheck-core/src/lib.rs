pub mod config;
pub mod discovery;
pub mod error;
pub mod follow;
pub mod hls;
pub mod logging;
pub mod process;
pub mod recorder;

pub use config::Config;
pub use error::{Error, Result};
