use std::path::PathBuf;

use crate::{
    registry::PeerId,
    wg::{Cidr, config::ParseError},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("no free address left in {0}")]
    ResourceExhausted(Cidr),

    #[error("peer {0} not found")]
    NotFound(PeerId),

    #[error("key generation failed: {0}")]
    CryptoFailure(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("parse error: {0}")]
    ParseError(#[from] ParseError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("wg cmd fail: {0:?}")]
    WgCommandFail(Option<i32>),

    #[error("encode error: {0}")]
    EncodeError(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    DecodeError(#[from] bincode::error::DecodeError),

    #[error("no state at {0}, run `init` first")]
    NotInitialized(PathBuf),
}
