//! Error types for proxy config compilation.

use thiserror::Error;

use crate::template::RenderError;

/// Errors raised while compiling a proxy config.
///
/// Any error fails the whole compile; no partial config is produced.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CompileError {
    /// Raised when a location path cannot be emitted as a `location` directive.
    #[error("locations[{index}] path '{path}' is invalid: {reason}")]
    InvalidLocationPath {
        /// Rule index in payload order.
        index: usize,
        /// Path as supplied.
        path: String,
        /// Which rule the path violates.
        reason: String,
    },
    /// Raised when two locations would match the same path.
    #[error("locations[{index}] path '{path}' duplicates {conflict}")]
    DuplicateLocation {
        /// Index of the later rule.
        index: usize,
        /// Shared path.
        path: String,
        /// The earlier location, such as `locations[0]` or the health check.
        conflict: String,
    },
    /// Raised when an explicit proxy target is not an http(s) URL.
    #[error("locations[{index}] proxy_pass '{target}' is invalid: {reason}")]
    InvalidProxyTarget {
        /// Rule index in payload order.
        index: usize,
        /// Target as supplied.
        target: String,
        /// Which rule the target violates.
        reason: String,
    },
    /// Raised when `extra` would open or close blocks it does not own.
    #[error("locations[{index}] extra has unbalanced braces")]
    UnbalancedExtra {
        /// Rule index in payload order.
        index: usize,
    },
    /// Raised when the server template cannot be rendered.
    #[error("proxy template failed: {0}")]
    Render(#[from] RenderError),
}
