use thiserror::Error;

use crate::{persistence, registry};

#[derive(Error, Debug)]
pub enum Error {
    /// Tag listing failed; nothing can be decided this cycle
    #[error("Upstream tag listing failed: {0}")]
    SourceUnavailable(#[source] registry::Error),
    /// The persistence layer is unreachable; without durable commits the
    /// cycle cannot safely proceed
    #[error("State store unavailable: {0}")]
    StateStore(#[from] persistence::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
