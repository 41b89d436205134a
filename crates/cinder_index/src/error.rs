//! Error types for cinder_index.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("value {0:#x} does not fit in a 47-bit reference")]
    OutOfRange(u64),
}
