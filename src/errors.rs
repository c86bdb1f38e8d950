//! The error taxonomy of spec §7: one kind family crossing every interface,
//! mirroring how `tvix-castore::Error` stays a single small enum that every
//! submodule's `thiserror` types fold into via `From`.

use thiserror::Error;

/// Errors that occur validating a [`crate::nodes::Node`] in isolation.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ValidateNodeError {
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    #[error("invalid digest: {0}")]
    InvalidDigest(#[from] crate::digest::DigestError),
    #[error("invalid symlink target: {0:?}")]
    InvalidSymlinkTarget(String),
}

/// Errors that occur validating a whole [`crate::nodes::Directory`] message.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ValidateDirectoryError {
    #[error("{0:?} is not sorted")]
    WrongSorting(String),
    #[error("{0:?} is a duplicate name")]
    DuplicateName(String),
    #[error("invalid node {0:?}: {1}")]
    InvalidNode(String, ValidateNodeError),
    #[error("total directory size overflows u64")]
    SizeOverflow,
}

/// The single error kind family crossing the crate's public interface (spec
/// §7). Composite operations wrap lower errors with additional context but
/// preserve the kind by nesting the source, rather than flattening to a
/// string.
#[derive(Debug, Error)]
pub enum Error {
    /// Local filesystem failure: permissions, disk full, short read/write.
    #[error("local storage I/O error: {0}")]
    StoreIo(#[from] std::io::Error),

    /// Lookup of an absent ref.
    #[error("ref not found: {0}")]
    RefMissing(String),

    /// A referenced blob is not present when needed.
    #[error("blob missing: {0}")]
    BlobMissing(crate::digest::Digest),

    /// An encoded Directory failed to parse or violates an invariant.
    #[error("directory failed to decode: {0}")]
    DirectoryDecode(#[from] ValidateDirectoryError),

    /// An import target exists as an incompatible type. Per spec §7 this is
    /// recorded in the import report's `ignored` list, not raised — this
    /// variant exists for the rare case an embedder wants to surface it as a
    /// hard error (e.g. from a non-import codepath).
    #[error("virtual directory conflict at {0:?}")]
    VirtualDirectoryConflict(String),

    /// A chained symlink was encountered during resolution (unsupported).
    #[error("symlink chain encountered resolving {0:?}")]
    SymlinkChain(String),

    /// A symlink's target does not resolve.
    #[error("broken symlink {0:?} -> {1:?}")]
    BrokenSymlink(String, String),

    /// The remote endpoint could not be reached at all.
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// A transient remote/network error; callers may retry.
    #[error("transient remote error: {0}")]
    RemoteTransient(String),

    /// Destination path collision on `checkout`.
    #[error("checkout conflict at {0:?}")]
    CheckoutConflict(String),

    /// Destination path collision on `export_files`.
    #[error("export conflict at {0:?}")]
    ExportConflict(String),
}

impl Error {
    /// True for error kinds spec §5/§7 mark as transient: callers may retry
    /// the operation without reinterpreting results already observed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RemoteTransient(_))
    }
}

impl From<crate::digest::DigestError> for Error {
    fn from(value: crate::digest::DigestError) -> Self {
        Error::DirectoryDecode(ValidateDirectoryError::InvalidNode(
            String::new(),
            ValidateNodeError::InvalidDigest(value),
        ))
    }
}

impl From<Error> for tonic::Status {
    fn from(value: Error) -> Self {
        match value {
            Error::RefMissing(name) => tonic::Status::not_found(format!("ref missing: {name}")),
            Error::BlobMissing(d) => tonic::Status::not_found(format!("blob missing: {d}")),
            Error::RemoteTransient(msg) => tonic::Status::resource_exhausted(msg),
            Error::RemoteUnavailable(msg) => tonic::Status::unavailable(msg),
            Error::DirectoryDecode(e) => tonic::Status::data_loss(e.to_string()),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::StoreIo(e) => e,
            Error::BlobMissing(_) | Error::RefMissing(_) => {
                std::io::Error::new(std::io::ErrorKind::NotFound, value.to_string())
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(value: tonic::Status) -> Self {
        use tonic::Code;
        match value.code() {
            Code::NotFound => Error::RefMissing(value.message().to_string()),
            Code::ResourceExhausted | Code::Unavailable | Code::DeadlineExceeded => {
                Error::RemoteTransient(value.message().to_string())
            }
            _ => Error::RemoteUnavailable(value.message().to_string()),
        }
    }
}
