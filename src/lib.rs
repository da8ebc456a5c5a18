pub mod broadcast;
pub mod config;
pub mod convert;
mod error;
pub mod log;
pub mod media;
pub mod relay;
pub mod result;
pub mod rtc;
pub mod session;
pub mod signal;
pub mod viewer;

pub use error::AppError;
