//! Error types for StrideDB operations
//!
//! All StrideDB errors are represented by the StrideError enum, which carries
//! enough context (paths, offsets, sizes) for debugging and recovery.

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// StrideDB error types with detailed context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrideError {
    /// A key passed to the public API did not have the fixed key width
    KeyWrongLength {
        /// Required key length in bytes
        expected: usize,
        /// Length of the key actually supplied
        actual: usize,
    },

    /// A zero-length value was passed to `put`
    ZeroLengthValue,

    /// The value is too large to be framed as a single log record
    ValueTooLong {
        /// Size of the rejected value
        length: u64,
        /// Largest accepted value size
        max: u64,
    },

    /// The key is present neither in the staging buffer nor in the tree
    KeyNotFound,

    /// A slot referenced a value-log region beyond the end of the log
    ValueNotFound {
        /// Byte offset of the missing record
        offset: u64,
        /// Expected record length
        length: u32,
    },

    /// A positional read returned fewer bytes than required
    ShortRead {
        /// File the read was issued against
        path: PathBuf,
        /// Byte offset of the read
        offset: u64,
        /// Bytes required
        expected: usize,
        /// Bytes actually read
        actual: usize,
    },

    /// A positional write made no progress before completing
    ShortWrite {
        /// File the write was issued against
        path: PathBuf,
        /// Byte offset of the write
        offset: u64,
        /// Bytes required
        expected: usize,
        /// Bytes actually written
        actual: usize,
    },

    /// A key-file block could not be decoded into a tree node
    CorruptBlock {
        /// Block id (byte offset into the key file)
        id: u64,
        /// Description of the corruption
        reason: String,
    },

    /// A configuration parameter failed validation
    InvalidConfig {
        /// Which parameter and why
        message: String,
    },

    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: io::ErrorKind,
        /// Human-readable description
        message: String,
    },
}

impl fmt::Display for StrideError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrideError::KeyWrongLength { expected, actual } => {
                write!(f, "key has wrong length: expected {} bytes, got {}", expected, actual)
            }

            StrideError::ZeroLengthValue => {
                write!(f, "zero-length values cannot be stored")
            }

            StrideError::ValueTooLong { length, max } => {
                write!(f, "value too long: {} bytes exceeds limit of {} bytes", length, max)
            }

            StrideError::KeyNotFound => write!(f, "key not found"),

            StrideError::ValueNotFound { offset, length } => {
                write!(f, "value not found: {} bytes at offset {} lie beyond the value log", length, offset)
            }

            StrideError::ShortRead { path, offset, expected, actual } => {
                write!(f, "short read in {} at offset {}: wanted {} bytes, got {}",
                       path.display(), offset, expected, actual)
            }

            StrideError::ShortWrite { path, offset, expected, actual } => {
                write!(f, "short write in {} at offset {}: wanted {} bytes, wrote {}",
                       path.display(), offset, expected, actual)
            }

            StrideError::CorruptBlock { id, reason } => {
                write!(f, "corrupt node block {}: {}", id, reason)
            }

            StrideError::InvalidConfig { message } => {
                write!(f, "invalid configuration: {}", message)
            }

            StrideError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }
        }
    }
}

impl Error for StrideError {}

/// Convert std::io::Error to StrideError::Io
impl From<io::Error> for StrideError {
    fn from(err: io::Error) -> Self {
        StrideError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for StrideDB operations
pub type StrideResult<T> = Result<T, StrideError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StrideError::ShortRead {
            path: PathBuf::from("/tmp/db.keys"),
            offset: 4096,
            expected: 4096,
            actual: 100,
        };

        let display = format!("{}", err);
        assert!(display.contains("short read"));
        assert!(display.contains("/tmp/db.keys"));
        assert!(display.contains("4096"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: StrideError = io_err.into();

        match err {
            StrideError::Io { kind, .. } => assert_eq!(kind, io::ErrorKind::NotFound),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_key_wrong_length_display() {
        let err = StrideError::KeyWrongLength { expected: 32, actual: 3 };
        assert_eq!(format!("{}", err), "key has wrong length: expected 32 bytes, got 3");
    }
}
