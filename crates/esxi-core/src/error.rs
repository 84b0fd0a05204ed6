//! Error types for the esxi-core library.

use std::path::PathBuf;

/// The main error type for ESXi extraction operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// An operation was invoked before its handshake or header read finished.
    #[error("not ready: cannot {operation}")]
    NotReady { operation: String },

    /// The session bootstrap failed; the session will not recover.
    #[error("session failed: {message}")]
    SessionFailed { message: String },

    /// The hypervisor answered a SOAP call with a fault.
    #[error("RPC fault in {method}: {fault}")]
    Rpc { method: String, fault: String },

    /// An HTTP exchange completed with a non-success status.
    #[error("HTTP {status} {reason} for {url}")]
    Http {
        status: u16,
        reason: String,
        url: String,
    },

    /// The HTTP client failed before a status was received.
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    /// A SOAP payload could not be encoded or decoded.
    #[error("XML error: {message}")]
    Xml { message: String },

    /// The property collector kept returning continuation tokens.
    #[error("property collection for {object_type} exceeded {pages} pages")]
    PaginationLimit { object_type: String, pages: usize },

    /// An export lease did not become ready within the poll bound.
    #[error("export lease {lease} not ready after {attempts} polls")]
    LeaseNotReady { lease: String, attempts: u32 },

    /// An export lease entered its error state.
    #[error("export lease {lease} failed: {message}")]
    LeaseFailed { lease: String, message: String },

    /// A download was cancelled by its caller.
    #[error("download of {url} cancelled")]
    Cancelled { url: String },

    /// Malformed or unsupported VMDK container.
    #[error("VMDK error: {message}")]
    Vmdk { message: String },

    /// A grain did not inflate to exactly one grain of data.
    #[error("grain at offset {offset} in '{path}' inflated to {actual} bytes, expected {expected}")]
    GrainSize {
        path: String,
        offset: u64,
        expected: usize,
        actual: usize,
    },

    /// A block id beyond the disk capacity was requested.
    #[error("block {block} out of range for '{path}' ({count} blocks)")]
    BlockOutOfRange { path: String, block: u32, count: u32 },

    /// A descriptor text file (VMX, VMDK descriptor, VMSD) is malformed.
    #[error("parse error in {file}: {message}")]
    Parse { file: String, message: String },

    /// A required hypervisor object or property is missing.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// Error in the parallel block pipeline.
    #[error("Pipeline error: {message}")]
    Pipeline { message: String },
}

/// A specialized Result type for ESXi extraction operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a precondition error for an operation run too early.
    pub fn not_ready(operation: impl Into<String>) -> Self {
        Self::NotReady {
            operation: operation.into(),
        }
    }

    /// Create an XML encode/decode error.
    pub fn xml(message: impl Into<String>) -> Self {
        Self::Xml {
            message: message.into(),
        }
    }

    /// Create a VMDK format error.
    pub fn vmdk(message: impl Into<String>) -> Self {
        Self::Vmdk {
            message: message.into(),
        }
    }

    /// Create a descriptor parse error.
    pub fn parse(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            file: file.into(),
            message: message.into(),
        }
    }

    /// Create a missing-object error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a pipeline error.
    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::Pipeline {
            message: message.into(),
        }
    }

    /// Returns true for an HTTP 404, which callers may treat as "absent".
    pub fn is_http_not_found(&self) -> bool {
        matches!(self, Self::Http { status: 404, .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
