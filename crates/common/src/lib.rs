//! Common types for the account pool service

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
