//! Chunked ChaCha20-Poly1305 stream encryption.
//!
//! Layout:
//!
//! ```text
//! magic "PSYN" | u32 version | u32 chunk size
//! frame*: u32 len | 12-byte nonce | ciphertext + 16-byte tag
//! ```
//!
//! Every frame is sealed with associated data binding its index and whether
//! it is the last frame. A stream always ends with a final frame (empty when
//! the plaintext length is a multiple of the chunk size or zero), so
//! truncation, reordering and splicing all fail authentication. Memory use is
//! one chunk on either side.

use super::keys::EncryptionKey;
use crate::{Result, SyncError};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use std::io::{self, Read, Write};

pub const MAGIC: [u8; 4] = *b"PSYN";
pub const FORMAT_VERSION: u32 = 1;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
/// Upper bound accepted from a stream header.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

const HEADER_SIZE: usize = 12;

fn associated_data(index: u64, last: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = last as u8;
    aad
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Map an I/O error from the adapters, surfacing authentication failures
/// as crypto errors.
fn into_sync_error(e: io::Error) -> SyncError {
    if e.kind() == io::ErrorKind::InvalidData {
        SyncError::Crypto(e.to_string())
    } else {
        SyncError::Io(e)
    }
}

/// Streaming encrypt/decrypt primitive.
pub trait StreamCipher: Send + Sync {
    /// Encrypt everything from `plaintext` into `ciphertext`, returning the
    /// number of plaintext bytes consumed.
    fn encrypt(&self, key: &EncryptionKey, plaintext: &mut dyn Read, ciphertext: &mut dyn Write) -> Result<u64>;

    /// Decrypt and authenticate a whole stream, returning the plaintext length.
    fn decrypt(&self, key: &EncryptionKey, ciphertext: &mut dyn Read, plaintext: &mut dyn Write) -> Result<u64>;

    fn encrypt_bytes(&self, key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(plaintext.len() + HEADER_SIZE + 64);
        self.encrypt(key, &mut io::Cursor::new(plaintext), &mut out)?;
        Ok(out)
    }

    fn decrypt_bytes(&self, key: &EncryptionKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(ciphertext.len());
        self.decrypt(key, &mut io::Cursor::new(ciphertext), &mut out)?;
        Ok(out)
    }
}

/// The chunked ChaCha20-Poly1305 format.
#[derive(Debug, Clone, Copy)]
pub struct ChunkedCipher {
    chunk_size: usize,
}

impl Default for ChunkedCipher {
    fn default() -> Self {
        Self { chunk_size: DEFAULT_CHUNK_SIZE }
    }
}

impl ChunkedCipher {
    /// Chunk size is clamped to `1..=MAX_CHUNK_SIZE`.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.clamp(1, MAX_CHUNK_SIZE),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn writer<W: Write>(&self, key: &EncryptionKey, inner: W) -> EncryptingWriter<W> {
        EncryptingWriter::new(key, inner, self.chunk_size)
    }

    pub fn reader<R: Read>(&self, key: &EncryptionKey, inner: R) -> DecryptingReader<R> {
        DecryptingReader::new(key, inner)
    }
}

impl StreamCipher for ChunkedCipher {
    fn encrypt(&self, key: &EncryptionKey, plaintext: &mut dyn Read, ciphertext: &mut dyn Write) -> Result<u64> {
        let mut writer = self.writer(key, ciphertext);
        let copied = io::copy(plaintext, &mut writer)?;
        writer.finish().map_err(into_sync_error)?;
        Ok(copied)
    }

    fn decrypt(&self, key: &EncryptionKey, ciphertext: &mut dyn Read, plaintext: &mut dyn Write) -> Result<u64> {
        let mut reader = self.reader(key, ciphertext);
        io::copy(&mut reader, plaintext).map_err(into_sync_error)
    }
}

/// Encrypts everything written to it into `inner`.
///
/// [`EncryptingWriter::finish`] must be called to emit the final frame;
/// dropping the writer without it leaves a stream that fails to decrypt.
pub struct EncryptingWriter<W: Write> {
    inner: W,
    cipher: ChaCha20Poly1305,
    chunk_size: usize,
    buf: Vec<u8>,
    index: u64,
    header_written: bool,
}

impl<W: Write> EncryptingWriter<W> {
    pub fn new(key: &EncryptionKey, inner: W, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        Self {
            inner,
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
            chunk_size,
            buf: Vec::with_capacity(chunk_size),
            index: 0,
            header_written: false,
        }
    }

    fn write_header(&mut self) -> io::Result<()> {
        if !self.header_written {
            let mut header = [0u8; HEADER_SIZE];
            header[..4].copy_from_slice(&MAGIC);
            header[4..8].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
            header[8..].copy_from_slice(&(self.chunk_size as u32).to_be_bytes());
            self.inner.write_all(&header)?;
            self.header_written = true;
        }
        Ok(())
    }

    fn seal_frame(&mut self, last: bool) -> io::Result<()> {
        self.write_header()?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let aad = associated_data(self.index, last);
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload { msg: &self.buf, aad: &aad },
            )
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("encryption failed: {e}")))?;

        self.inner.write_all(&(sealed.len() as u32).to_be_bytes())?;
        self.inner.write_all(&nonce_bytes)?;
        self.inner.write_all(&sealed)?;
        self.buf.clear();
        self.index += 1;
        Ok(())
    }

    /// Emit the final frame and return the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.seal_frame(true)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        // A full buffer is only sealed once more data arrives, so the last
        // chunk is always the one marked final.
        if self.buf.len() == self.chunk_size {
            self.seal_frame(false)?;
        }
        let take = (self.chunk_size - self.buf.len()).min(data.len());
        self.buf.extend_from_slice(&data[..take]);
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypts and authenticates a stream produced by [`EncryptingWriter`].
pub struct DecryptingReader<R: Read> {
    inner: R,
    cipher: ChaCha20Poly1305,
    max_frame: usize,
    plain: Vec<u8>,
    pos: usize,
    index: u64,
    header_read: bool,
    finished: bool,
}

impl<R: Read> DecryptingReader<R> {
    pub fn new(key: &EncryptionKey, inner: R) -> Self {
        Self {
            inner,
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
            max_frame: 0,
            plain: Vec::new(),
            pos: 0,
            index: 0,
            header_read: false,
            finished: false,
        }
    }

    fn read_header(&mut self) -> io::Result<()> {
        let mut header = [0u8; HEADER_SIZE];
        read_exact_or_truncated(&mut self.inner, &mut header)?;
        if header[..4] != MAGIC {
            return Err(invalid("not an encrypted stream (bad magic)"));
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != FORMAT_VERSION {
            return Err(invalid(format!("unsupported stream version {version}")));
        }
        let chunk_size = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(invalid(format!("invalid chunk size {chunk_size}")));
        }
        self.max_frame = chunk_size + TAG_SIZE;
        self.header_read = true;
        Ok(())
    }

    fn open_frame(&mut self) -> io::Result<()> {
        let mut len_bytes = [0u8; 4];
        read_exact_or_truncated(&mut self.inner, &mut len_bytes)?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if !(TAG_SIZE..=self.max_frame).contains(&len) {
            return Err(invalid(format!("invalid frame length {len}")));
        }

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        read_exact_or_truncated(&mut self.inner, &mut nonce_bytes)?;
        let mut sealed = vec![0u8; len];
        read_exact_or_truncated(&mut self.inner, &mut sealed)?;

        let nonce = Nonce::from_slice(&nonce_bytes);
        // Try as an intermediate frame first, then as the final one.
        let (plain, last) = match self.cipher.decrypt(
            nonce,
            Payload { msg: &sealed, aad: &associated_data(self.index, false) },
        ) {
            Ok(plain) => (plain, false),
            Err(_) => {
                let plain = self
                    .cipher
                    .decrypt(nonce, Payload { msg: &sealed, aad: &associated_data(self.index, true) })
                    .map_err(|_| invalid("decryption failed (wrong key or tampered data)"))?;
                (plain, true)
            }
        };

        self.index += 1;
        self.plain = plain;
        self.pos = 0;

        if last {
            self.finished = true;
            let mut probe = [0u8; 1];
            if self.inner.read(&mut probe)? != 0 {
                return Err(invalid("trailing data after final frame"));
            }
        }
        Ok(())
    }
}

fn read_exact_or_truncated<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            invalid("encrypted stream is truncated")
        } else {
            e
        }
    })
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if !self.header_read {
            self.read_header()?;
        }
        while self.pos == self.plain.len() {
            if self.finished {
                return Ok(0);
            }
            self.open_frame()?;
        }
        let n = (self.plain.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::KEY_SIZE;

    fn key() -> EncryptionKey {
        EncryptionKey::from_bytes([3u8; KEY_SIZE])
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_round_trip_across_chunk_boundaries() {
        let cipher = ChunkedCipher::new(16);
        for len in [0, 1, 15, 16, 17, 32, 100] {
            let plain = payload(len);
            let sealed = cipher.encrypt_bytes(&key(), &plain).unwrap();
            assert_eq!(cipher.decrypt_bytes(&key(), &sealed).unwrap(), plain, "len {len}");
        }
    }

    #[test]
    fn test_ciphertext_hides_plaintext() {
        let cipher = ChunkedCipher::default();
        let plain = b"attack at dawn, attack at dawn".to_vec();
        let sealed = cipher.encrypt_bytes(&key(), &plain).unwrap();
        assert!(!sealed.windows(plain.len()).any(|w| w == plain.as_slice()));
        assert_eq!(&sealed[..4], b"PSYN");
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher = ChunkedCipher::default();
        let sealed = cipher.encrypt_bytes(&key(), b"secret").unwrap();
        let other = EncryptionKey::from_bytes([9u8; KEY_SIZE]);
        assert!(matches!(cipher.decrypt_bytes(&other, &sealed), Err(SyncError::Crypto(_))));
    }

    #[test]
    fn test_tampered_byte_fails() {
        let cipher = ChunkedCipher::default();
        let mut sealed = cipher.encrypt_bytes(&key(), b"secret payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cipher.decrypt_bytes(&key(), &sealed).is_err());
    }

    #[test]
    fn test_dropping_final_frame_is_detected() {
        let cipher = ChunkedCipher::new(8);
        let sealed = cipher.encrypt_bytes(&key(), &payload(20)).unwrap();

        // Frames are 4 + 12 + (chunk + 16) bytes; cut after the first two.
        let frame = 4 + NONCE_SIZE + 8 + TAG_SIZE;
        let cut = &sealed[..HEADER_SIZE + 2 * frame];
        let err = cipher.decrypt_bytes(&key(), cut).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_unfinished_writer_produces_undecryptable_stream() {
        let cipher = ChunkedCipher::new(4);
        let mut out = Vec::new();
        {
            let mut writer = cipher.writer(&key(), &mut out);
            writer.write_all(&payload(10)).unwrap();
        }
        assert!(cipher.decrypt_bytes(&key(), &out).is_err());
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let cipher = ChunkedCipher::default();
        let mut sealed = cipher.encrypt_bytes(&key(), b"abc").unwrap();
        sealed.push(0);
        assert!(cipher.decrypt_bytes(&key(), &sealed).is_err());
    }

    #[test]
    fn test_garbage_input_rejected() {
        let cipher = ChunkedCipher::default();
        assert!(cipher.decrypt_bytes(&key(), b"{\"version\":1}").is_err());
        assert!(cipher.decrypt_bytes(&key(), b"").is_err());
    }
}
