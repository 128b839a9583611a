//! Shared types for the parcelkeeper chunk store: the error taxonomy (spec
//! §7), crypto/compression enums (spec §3), the `parcel.cfg` parser (spec
//! §6.1), and the chunk metadata row shared between the keyring and the
//! caches (spec §3 Chunk / §4.2 Keyring).

pub mod chunk;
pub mod crypto;
pub mod error;
pub mod parcel;

pub use chunk::{ChunkIndex, ChunkMeta};
pub use crypto::{Compression, CryptoSuite};
pub use error::{ErrorKind, PkError, PkResult};
pub use parcel::Parcel;
