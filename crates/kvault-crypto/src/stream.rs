//! Chunked AES-256-GCM for file blobs
//!
//! Blob layout:
//! ```text
//! header = [version u8][kdf id u8][kdf params][salt 16][nonce prefix 7]
//! body   = [sealed chunk 0] ... [sealed chunk n]
//! sealed chunk = ciphertext (<= 64 KiB) || tag (16)
//! nonce(i)     = nonce_prefix (7) || i (u32 BE) || last_flag (1)
//! AAD          = header bytes
//! ```
//!
//! Every chunk except the last carries exactly `CHUNK_SIZE` plaintext bytes.
//! The last-chunk flag is part of the nonce, so truncating the stream at a
//! chunk boundary, dropping or reordering chunks, or appending data all fail
//! tag verification.

use std::io::{self, Read, Write};

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::kdf::{derive_key, KdfParams};
use crate::passphrase::Passphrase;
use crate::random::random_array;
use crate::{FORMAT_VERSION, NONCE_SIZE, TAG_SIZE};

/// Size of the per-blob KDF salt
pub const STREAM_SALT_SIZE: usize = 16;

/// Random part of every chunk nonce
pub const NONCE_PREFIX_SIZE: usize = 7;

/// Plaintext bytes per chunk
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Ciphertext bytes per full chunk
pub const SEALED_CHUNK_SIZE: usize = CHUNK_SIZE + TAG_SIZE;

/// Per-blob header: format version, KDF parameters, salt and nonce prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: u8,
    pub kdf: KdfParams,
    pub salt: [u8; STREAM_SALT_SIZE],
    pub nonce_prefix: [u8; NONCE_PREFIX_SIZE],
}

impl StreamHeader {
    /// Bytes needed to learn the full header length (version + KDF id)
    pub const PREFIX_LEN: usize = 2;

    /// Full header length, given its first `PREFIX_LEN` bytes.
    pub fn total_len(prefix: &[u8]) -> Result<usize, CryptoError> {
        if prefix.len() < Self::PREFIX_LEN {
            return Err(CryptoError::Malformed("blob header truncated".into()));
        }
        if prefix[0] != FORMAT_VERSION {
            return Err(CryptoError::UnsupportedVersion(prefix[0]));
        }
        Ok(1 + KdfParams::encoded_len(prefix[1])? + STREAM_SALT_SIZE + NONCE_PREFIX_SIZE)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let kdf = self.kdf.encode();
        let mut out = Vec::with_capacity(1 + kdf.len() + STREAM_SALT_SIZE + NONCE_PREFIX_SIZE);
        out.push(self.version);
        out.extend_from_slice(&kdf);
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.nonce_prefix);
        out
    }

    /// Decode a header that spans exactly `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, CryptoError> {
        let expected = Self::total_len(bytes)?;
        if bytes.len() != expected {
            return Err(CryptoError::Malformed(format!(
                "blob header has {} bytes (expected {expected})",
                bytes.len()
            )));
        }

        let (kdf, used) = KdfParams::decode(&bytes[1..])?;
        let rest = &bytes[1 + used..];
        let (salt, nonce_prefix) = rest.split_at(STREAM_SALT_SIZE);

        let mut header = StreamHeader {
            version: bytes[0],
            kdf,
            salt: [0u8; STREAM_SALT_SIZE],
            nonce_prefix: [0u8; NONCE_PREFIX_SIZE],
        };
        header.salt.copy_from_slice(salt);
        header.nonce_prefix.copy_from_slice(nonce_prefix);
        Ok(header)
    }

    /// Parse a header from the front of `bytes`, which may already hold
    /// body data.
    ///
    /// `Ok(None)` means more bytes are needed. Otherwise returns the header
    /// and the number of bytes it occupies.
    pub fn parse(bytes: &[u8]) -> Result<Option<(Self, usize)>, CryptoError> {
        if bytes.len() < Self::PREFIX_LEN {
            return Ok(None);
        }
        let total = Self::total_len(bytes)?;
        if bytes.len() < total {
            return Ok(None);
        }
        Self::decode(&bytes[..total]).map(|header| Some((header, total)))
    }
}

fn chunk_nonce(prefix: &[u8; NONCE_PREFIX_SIZE], counter: u32, last: bool) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..NONCE_PREFIX_SIZE].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_SIZE..NONCE_SIZE - 1].copy_from_slice(&counter.to_be_bytes());
    nonce[NONCE_SIZE - 1] = u8::from(last);
    nonce
}

/// Seals consecutive plaintext chunks of one blob.
struct ChunkSealer {
    cipher: Aes256Gcm,
    nonce_prefix: [u8; NONCE_PREFIX_SIZE],
    aad: Vec<u8>,
    counter: u32,
    finished: bool,
}

impl ChunkSealer {
    /// Non-final chunks must be exactly `CHUNK_SIZE` bytes; the final chunk
    /// may be shorter, including empty.
    fn seal(&mut self, chunk: &[u8], last: bool) -> Result<Vec<u8>, CryptoError> {
        if self.finished {
            return Err(CryptoError::InvalidParams(
                "stream already sealed its final chunk".into(),
            ));
        }
        if chunk.len() > CHUNK_SIZE || (!last && chunk.len() != CHUNK_SIZE) {
            return Err(CryptoError::InvalidParams(format!(
                "chunk of {} bytes (non-final chunks must be {CHUNK_SIZE})",
                chunk.len()
            )));
        }

        let nonce = chunk_nonce(&self.nonce_prefix, self.counter, last);
        let mut buffer = Vec::with_capacity(chunk.len() + TAG_SIZE);
        buffer.extend_from_slice(chunk);
        self.cipher
            .encrypt_in_place(Nonce::from_slice(&nonce), &self.aad, &mut buffer)
            .map_err(|_| CryptoError::Encryption)?;

        if last {
            self.finished = true;
        } else {
            self.counter = self.counter.checked_add(1).ok_or_else(|| {
                CryptoError::InvalidParams("stream exceeds the maximum chunk count".into())
            })?;
        }
        Ok(buffer)
    }
}

/// Opens consecutive sealed chunks of one blob.
struct ChunkOpener {
    cipher: Aes256Gcm,
    nonce_prefix: [u8; NONCE_PREFIX_SIZE],
    aad: Vec<u8>,
    counter: u32,
    finished: bool,
}

impl ChunkOpener {
    fn open(&mut self, frame: &[u8], last: bool) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if self.finished {
            return Err(CryptoError::Malformed("data after final chunk".into()));
        }
        if frame.len() < TAG_SIZE || frame.len() > SEALED_CHUNK_SIZE {
            return Err(CryptoError::Authentication);
        }
        if !last && frame.len() != SEALED_CHUNK_SIZE {
            return Err(CryptoError::Authentication);
        }

        let nonce = chunk_nonce(&self.nonce_prefix, self.counter, last);
        let mut buffer = Zeroizing::new(frame.to_vec());
        self.cipher
            .decrypt_in_place(Nonce::from_slice(&nonce), &self.aad, &mut *buffer)
            .map_err(|_| CryptoError::Authentication)?;

        if last {
            self.finished = true;
        } else {
            self.counter = self
                .counter
                .checked_add(1)
                .ok_or_else(|| CryptoError::Malformed("chunk counter overflow".into()))?;
        }
        Ok(buffer)
    }
}

/// Incremental encryptor for one blob body.
///
/// Plaintext goes in through [`update`](Self::update) in pieces of any size
/// and sealed bytes come out. A full chunk is sealed only once more input
/// follows it, so whatever is still held at [`finish`](Self::finish) becomes
/// the final chunk.
pub struct StreamEncryptor {
    sealer: ChunkSealer,
    pending: Zeroizing<Vec<u8>>,
}

impl StreamEncryptor {
    /// Buffer `plaintext`; returns every chunk that is now known not to be
    /// the last one, sealed. The result may be empty.
    pub fn update(&mut self, mut plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut sealed = Vec::new();
        while !plaintext.is_empty() {
            if self.pending.len() == CHUNK_SIZE {
                sealed.extend_from_slice(&self.sealer.seal(&self.pending, false)?);
                self.pending.clear();
            }
            let take = (CHUNK_SIZE - self.pending.len()).min(plaintext.len());
            self.pending.extend_from_slice(&plaintext[..take]);
            plaintext = &plaintext[take..];
        }
        Ok(sealed)
    }

    /// Seal the final chunk.
    pub fn finish(mut self) -> Result<Vec<u8>, CryptoError> {
        self.sealer.seal(&self.pending, true)
    }
}

impl std::fmt::Debug for StreamEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEncryptor")
            .field("chunks_sealed", &self.sealer.counter)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// Incremental decryptor for one blob body.
///
/// Stored bytes that follow the header go in through
/// [`update`](Self::update); [`next_chunk`](Self::next_chunk) hands out
/// verified plaintext. The caller only reports whether its source is
/// exhausted; every framing decision is made here.
pub struct StreamDecryptor {
    opener: ChunkOpener,
    pending: Vec<u8>,
}

impl StreamDecryptor {
    /// Append stored bytes.
    pub fn update(&mut self, stored: &[u8]) {
        self.pending.extend_from_slice(stored);
    }

    /// Open the next chunk, if enough input has arrived to frame it.
    ///
    /// `eof` says whether the stored stream has ended. `Ok(None)` means more
    /// input is needed, or that the final chunk has been opened
    /// ([`is_finished`](Self::is_finished)). Once `eof` is set and the blob
    /// is not finished, this never returns `Ok(None)`.
    pub fn next_chunk(&mut self, eof: bool) -> Result<Option<Zeroizing<Vec<u8>>>, CryptoError> {
        if self.opener.finished {
            if self.pending.is_empty() {
                return Ok(None);
            }
            return Err(CryptoError::Malformed("data after final chunk".into()));
        }

        // A full frame is the last one only if nothing follows it.
        if self.pending.len() > SEALED_CHUNK_SIZE {
            let plain = self.opener.open(&self.pending[..SEALED_CHUNK_SIZE], false)?;
            self.pending.drain(..SEALED_CHUNK_SIZE);
            return Ok(Some(plain));
        }
        if !eof {
            return Ok(None);
        }
        if self.pending.is_empty() {
            // The stream ended before its final chunk.
            return Err(CryptoError::Authentication);
        }

        let frame = std::mem::take(&mut self.pending);
        self.opener.open(&frame, true).map(Some)
    }

    pub fn is_finished(&self) -> bool {
        self.opener.finished
    }
}

impl std::fmt::Debug for StreamDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDecryptor")
            .field("chunks_opened", &self.opener.counter)
            .field("finished", &self.opener.finished)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// Passphrase encryption for byte streams of any length
#[derive(Debug, Clone)]
pub struct StreamCipher {
    params: KdfParams,
}

impl StreamCipher {
    pub fn new(params: KdfParams) -> Result<Self, CryptoError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Start a new blob: fresh salt and nonce prefix, derived key.
    pub fn begin_encrypt(
        &self,
        passphrase: &Passphrase,
    ) -> Result<(StreamHeader, StreamEncryptor), CryptoError> {
        let header = StreamHeader {
            version: FORMAT_VERSION,
            kdf: self.params,
            salt: random_array(),
            nonce_prefix: random_array(),
        };

        let key = derive_key(passphrase, &header.salt, &header.kdf)?;
        let sealer = ChunkSealer {
            cipher: Aes256Gcm::new(key.as_bytes().into()),
            nonce_prefix: header.nonce_prefix,
            aad: header.to_bytes(),
            counter: 0,
            finished: false,
        };
        let encryptor = StreamEncryptor {
            sealer,
            pending: Zeroizing::new(Vec::with_capacity(CHUNK_SIZE)),
        };
        Ok((header, encryptor))
    }

    /// Derive the key for an existing blob from its header.
    pub fn begin_decrypt(
        header: &StreamHeader,
        passphrase: &Passphrase,
    ) -> Result<StreamDecryptor, CryptoError> {
        if header.version != FORMAT_VERSION {
            return Err(CryptoError::UnsupportedVersion(header.version));
        }
        header.kdf.validate_stored()?;

        let key = derive_key(passphrase, &header.salt, &header.kdf)?;
        let opener = ChunkOpener {
            cipher: Aes256Gcm::new(key.as_bytes().into()),
            nonce_prefix: header.nonce_prefix,
            aad: header.to_bytes(),
            counter: 0,
            finished: false,
        };
        Ok(StreamDecryptor {
            opener,
            pending: Vec::with_capacity(2 * SEALED_CHUNK_SIZE),
        })
    }

    /// Encrypt everything from `input` into `output`, one chunk at a time.
    ///
    /// Returns the number of plaintext bytes consumed.
    pub fn encrypt_stream<R: Read, W: Write>(
        &self,
        passphrase: &Passphrase,
        mut input: R,
        mut output: W,
    ) -> Result<u64, CryptoError> {
        let (header, mut encryptor) = self.begin_encrypt(passphrase)?;
        output.write_all(&header.to_bytes())?;

        let mut buf = Zeroizing::new(vec![0u8; CHUNK_SIZE]);
        let mut total = 0u64;
        loop {
            let n = read_some(&mut input, &mut buf)?;
            if n == 0 {
                break;
            }
            total += n as u64;
            output.write_all(&encryptor.update(&buf[..n])?)?;
        }
        output.write_all(&encryptor.finish()?)?;

        output.flush()?;
        Ok(total)
    }

    /// Start decrypting a stored blob.
    ///
    /// Reads the header, derives the key and opens the first chunk before
    /// returning, so a wrong passphrase is reported here and never as a
    /// partial read.
    pub fn decrypt_stream<R: Read>(
        mut stored: R,
        passphrase: &Passphrase,
    ) -> Result<DecryptReader<R>, CryptoError> {
        let (header, rest) = read_header(&mut stored)?;
        let mut decryptor = Self::begin_decrypt(&header, passphrase)?;
        decryptor.update(&rest);

        let mut reader = DecryptReader {
            inner: stored,
            decryptor,
            buf: vec![0u8; SEALED_CHUNK_SIZE],
            eof: false,
            plain: Zeroizing::new(Vec::new()),
            pos: 0,
        };
        if let Some(first) = reader.next_chunk()? {
            reader.plain = first;
        }
        Ok(reader)
    }
}

/// Read size while looking for the header; larger than any header
const HEADER_READ_SIZE: usize = 64;

/// Read the header; returns it with any body bytes read past it.
fn read_header<R: Read>(reader: &mut R) -> Result<(StreamHeader, Vec<u8>), CryptoError> {
    let mut bytes = Vec::with_capacity(HEADER_READ_SIZE);
    let mut buf = [0u8; HEADER_READ_SIZE];
    loop {
        if let Some((header, used)) = StreamHeader::parse(&bytes)? {
            bytes.drain(..used);
            return Ok((header, bytes));
        }
        let n = read_some(reader, &mut buf)?;
        if n == 0 {
            return Err(CryptoError::Malformed("blob header truncated".into()));
        }
        bytes.extend_from_slice(&buf[..n]);
    }
}

fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Plaintext view over a stored blob; a single forward pass.
pub struct DecryptReader<R> {
    inner: R,
    decryptor: StreamDecryptor,
    buf: Vec<u8>,
    eof: bool,
    plain: Zeroizing<Vec<u8>>,
    pos: usize,
}

impl<R: Read> DecryptReader<R> {
    fn next_chunk(&mut self) -> Result<Option<Zeroizing<Vec<u8>>>, CryptoError> {
        loop {
            if let Some(chunk) = self.decryptor.next_chunk(self.eof)? {
                return Ok(Some(chunk));
            }
            if self.decryptor.is_finished() {
                return Ok(None);
            }
            let n = read_some(&mut self.inner, &mut self.buf)?;
            if n == 0 {
                self.eof = true;
            } else {
                self.decryptor.update(&self.buf[..n]);
            }
        }
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.plain.len() {
            match self.next_chunk().map_err(into_io_error)? {
                Some(chunk) => {
                    self.plain = chunk;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn into_io_error(err: CryptoError) -> io::Error {
    match err {
        CryptoError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}
