//! Error types for backend calls and the fatal-failure policy
//!
//! Backend methods report failures through [`RhiError`]. The caches and pools
//! built on top of them never hand those errors to their caller: a failed
//! native object creation mid-frame has no recovery path at this layer, so
//! every result is funneled through [`OrFatal::or_fatal`], which logs the
//! diagnostic and panics. Release builds are compiled with `panic = "abort"`.

use ash::vk;
use std::fmt::Display;
use thiserror::Error;

/// Errors reported by a [`RenderDevice`](crate::backend::RenderDevice)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RhiError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// The memory allocator could not satisfy a request
    #[error("Out of device memory (requested {requested} bytes)")]
    OutOfMemory {
        /// Size of the failed request in bytes
        requested: u64,
    },

    /// Operation rejected by the backend
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Human readable reason
        reason: String,
    },

    /// Backend setup failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
}

impl From<vk::Result> for RhiError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::OutOfMemory { requested: 0 }
            }
            other => Self::Api(other),
        }
    }
}

/// Result type for backend calls
pub type RhiResult<T> = Result<T, RhiError>;

/// Converts a backend result into a value, treating any error as fatal
pub trait OrFatal<T> {
    /// Return the value, or log `context` with the error and panic
    fn or_fatal(self, context: impl Display) -> T;
}

impl<T> OrFatal<T> for RhiResult<T> {
    #[track_caller]
    fn or_fatal(self, context: impl Display) -> T {
        match self {
            Ok(value) => value,
            Err(err) => fatal(context, &err),
        }
    }
}

/// Log a backend failure and terminate
#[track_caller]
pub fn fatal(context: impl Display, err: &RhiError) -> ! {
    log::error!("{}: {}", context, err);
    panic!("fatal backend failure: {context}: {err}");
}
