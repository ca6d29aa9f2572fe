pub mod card;
pub mod config;
pub mod driver;
pub mod error;
pub mod fence;
pub mod gpu;
pub mod kms;
pub mod render;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use error::{Error, ErrorKind, Result};
