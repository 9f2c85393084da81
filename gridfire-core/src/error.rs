//! Error taxonomy for the pipeline.
//!
//! Every failure is classified into an [`ErrorClass`], which is what stage
//! handlers and the HTTP layer branch on. The concrete variants keep their
//! source errors for logging.

use std::{io, time::Duration};

use gridfire_model::ModelError;
use thiserror::Error;

use crate::{
    crypto::CipherError, packager::PackagerError, queue::QueueError,
    storage::StorageError, tracks::RepositoryError, transcode::TranscodeError,
};

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad request input; rejected synchronously with no side effects.
    Validation,
    /// The caller is not allowed to touch the resource.
    Forbidden,
    /// A referenced record or object does not exist.
    NotFound,
    /// Infrastructure hiccup; the same work may succeed if retried.
    Transient,
    /// The content itself is unusable; retrying cannot help.
    Content,
    /// The job does not fit the track's current state.
    Consistency,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        self == ErrorClass::Transient
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("transcode error: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("packager error: {0}")]
    Packager(#[from] PackagerError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Forbidden(String),

    #[error("unexpected track state: {0}")]
    Consistency(String),

    #[error("stage timed out after {0:?}")]
    Timeout(Duration),
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Model(ModelError::InvalidTransition { .. }) => {
                ErrorClass::Consistency
            }
            PipelineError::Model(_) => ErrorClass::Validation,
            PipelineError::Storage(err) => err.class(),
            PipelineError::Cipher(_) => ErrorClass::Content,
            PipelineError::Transcode(err) => err.class(),
            PipelineError::Packager(_) => ErrorClass::Content,
            PipelineError::Queue(err) => err.class(),
            PipelineError::Repository(err) => err.class(),
            PipelineError::Io(err) => io_class(err),
            PipelineError::Forbidden(_) => ErrorClass::Forbidden,
            PipelineError::Consistency(_) => ErrorClass::Consistency,
            PipelineError::Timeout(_) => ErrorClass::Content,
        }
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        PipelineError::Consistency(message.into())
    }
}

/// Classifies an I/O error that may be carrying a cipher failure from a
/// decrypting stream further up the pipe.
pub fn io_class(err: &io::Error) -> ErrorClass {
    if err
        .get_ref()
        .is_some_and(|inner| inner.downcast_ref::<CipherError>().is_some())
    {
        return ErrorClass::Content;
    }
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
            ErrorClass::Content
        }
        io::ErrorKind::NotFound => ErrorClass::NotFound,
        _ => ErrorClass::Transient,
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
