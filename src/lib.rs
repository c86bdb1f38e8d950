//! A content-addressable storage engine: hash-indexed blobs, named refs, a
//! mutable virtual directory layer over immutable Merkle trees, and gRPC
//! replication against a Remote-Execution-v2-shaped remote. See `spec.md`
//! and `SPEC_FULL.md` at the workspace root for the full module map.

pub mod blob_store;
pub mod cas_store;
pub mod digest;
pub mod directory_codec;
pub mod errors;
pub mod gc;
pub mod nodes;
pub(crate) mod path;
pub mod proto;
pub mod ref_store;
pub mod remote;
pub mod server;
pub mod virtual_directory;

pub use blob_store::BlobStore;
pub use cas_store::{CASStore, ReachableOptions};
pub use digest::{Digest, DigestError};
pub use directory_codec::DirectoryCodec;
pub use errors::Error;
pub use gc::{collect as gc_collect, GcRegistry, GcReport, ReachabilityCallback};
pub use ref_store::RefStore;
pub use remote::{RemoteClient, RemoteClientConfig};
pub use virtual_directory::{ImportReport, VirtualDirectory};
