//! Shutdown error definitions.

use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

use crate::lifecycle::signals::Signal;

/// Errors surfaced synchronously by [`ShutdownController::install`].
///
/// [`ShutdownController::install`]: crate::lifecycle::ShutdownController::install
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// The controller was misconfigured or installed twice.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The OS refused to register a signal handler.
    #[error("Failed to register {signal} handler: {source}")]
    SignalRegistration {
        signal: Signal,
        #[source]
        source: std::io::Error,
    },
}

/// Errors a drain target can report while being shut down.
#[derive(Debug, Error)]
pub enum DrainError {
    /// Forcibly closing the remaining connections failed.
    #[error("Forced close failed: {0}")]
    ForceClose(String),
}

/// An error that caused, or happened during, a shutdown.
///
/// Cheap to clone so it can be stored as the shutdown reason and handed to
/// every observer.
#[derive(Debug, Clone, Error)]
#[error("{inner}")]
pub struct DrainFault {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
}

impl DrainFault {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    /// A fault that only carries a message, e.g. a panic payload.
    pub fn msg(message: impl Into<String>) -> Self {
        let boxed: Box<dyn StdError + Send + Sync> = message.into().into();
        Self {
            inner: Arc::from(boxed),
        }
    }

    /// The underlying error.
    pub fn get_ref(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.inner.as_ref()
    }
}

impl From<DrainError> for DrainFault {
    fn from(error: DrainError) -> Self {
        Self::new(error)
    }
}

impl From<std::io::Error> for DrainFault {
    fn from(error: std::io::Error) -> Self {
        Self::new(error)
    }
}
