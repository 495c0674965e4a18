//! Encryption of everything that leaves this host.

pub mod keys;
pub mod stream;

pub use keys::{EncryptionKey, FileKeyStore, KeyStore, StaticKeyStore};
pub use stream::{ChunkedCipher, DecryptingReader, EncryptingWriter, StreamCipher};
