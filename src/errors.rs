//! Errors surfaced above the backend boundary: CLI/bootstrap configuration
//! problems that aren't POSIX errno conditions and therefore don't belong in
//! the [crate::backend::Error] taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("backend error: {0}")]
    Backend(#[from] crate::backend::Error),
}
