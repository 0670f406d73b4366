//! Error taxonomy for the storage core: one closed enum covering every
//! failure mode the public surface can report, instead of boolean or
//! sentinel returns.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Empty path, an over-long component, or `/` used where forbidden.
    #[error("invalid path")]
    InvalidPath,

    /// An intermediate or terminal path component did not resolve.
    #[error("no such file or directory")]
    NotFound,

    /// Creation target already exists.
    #[error("already exists")]
    AlreadyExists,

    /// Attempted to remove a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,

    /// The free-space allocator has no sectors left to give out.
    #[error("no space left on device")]
    NoSpace,

    /// A device read/write failed, or a sector id was out of range.
    #[error("i/o failure")]
    IoFail,

    /// Transient allocation failure (e.g. a bounce buffer).
    #[error("out of memory")]
    OutOfMemory,
}

pub type FsResult<T> = Result<T, FsError>;
