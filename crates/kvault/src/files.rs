//! File vault: streaming encryption into a blob store
//!
//! Upload pipes plaintext through a `StreamEncryptor` into a duplex pipe that
//! the blob store consumes, so neither side buffers the whole file. Download
//! reads the blob header, derives the key on a worker, verifies the first
//! chunk, then yields plaintext chunk by chunk from a `StreamDecryptor`.
//! Chunk framing lives in kvault-crypto; this module only moves bytes.

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use kvault_core::{VaultError, VaultResult};
use kvault_crypto::stream::{CHUNK_SIZE, SEALED_CHUNK_SIZE};
use kvault_crypto::{
    KdfParams, Passphrase, StreamCipher, StreamDecryptor, StreamEncryptor, StreamHeader,
};
use kvault_storage::{BlobReader, FileBlobStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::{map_crypto_error, run_blocking};

/// Decrypted file contents, one chunk per item
pub type PlaintextStream = BoxStream<'static, VaultResult<Bytes>>;

const PIPE_CAPACITY: usize = 64 * 1024;

pub struct FileVault<B> {
    store: B,
    cipher: StreamCipher,
}

impl<B: FileBlobStore> FileVault<B> {
    pub fn new(store: B, params: KdfParams) -> VaultResult<Self> {
        let cipher = StreamCipher::new(params).map_err(map_crypto_error)?;
        Ok(Self { store, cipher })
    }

    pub fn store(&self) -> &B {
        &self.store
    }

    /// Encrypt everything from `input` and store it. Returns the generated
    /// blob name.
    pub async fn upload<R>(&self, input: R, passphrase: Passphrase) -> VaultResult<String>
    where
        R: AsyncRead + Send + Unpin,
    {
        let cipher = self.cipher.clone();
        let (header, encryptor) = run_blocking(move || {
            cipher
                .begin_encrypt(&passphrase)
                .map_err(map_crypto_error)
        })
        .await?;

        let (tx, rx) = tokio::io::duplex(PIPE_CAPACITY);
        let producer = encrypt_into(input, header, encryptor, tx);
        let (produced, stored) = tokio::join!(producer, self.store.store(Box::new(rx)));

        match (produced, stored) {
            (Ok(bytes), Ok(name)) => {
                info!(name = %name, bytes, "stored encrypted file");
                Ok(name)
            }
            (Err(e), Ok(name)) => {
                if let Err(del) = self.store.delete(&name).await {
                    warn!(name = %name, "failed to remove partial blob: {del}");
                }
                Err(e)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(VaultError::Io(pe)), Err(se)) if pe.kind() == std::io::ErrorKind::BrokenPipe => {
                Err(se)
            }
            (Err(pe), Err(_)) => Err(pe),
        }
    }

    /// Open a stored file for decryption.
    ///
    /// Fails up front with `NotFound` for unknown names and `Authentication`
    /// for a wrong passphrase or a damaged header or first chunk. Later
    /// chunks are verified as the stream is polled; a failure there ends the
    /// stream with `Authentication`.
    pub async fn download(
        &self,
        name: &str,
        passphrase: Passphrase,
    ) -> VaultResult<PlaintextStream> {
        let mut reader = self
            .store
            .retrieve(name)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("file: {name}")))?;

        let (header, body) = read_header(&mut reader).await?;
        let mut decryptor = run_blocking(move || {
            StreamCipher::begin_decrypt(&header, &passphrase).map_err(map_crypto_error)
        })
        .await?;
        decryptor.update(&body);

        let mut state = OpenBlob {
            reader,
            decryptor,
            buf: vec![0u8; SEALED_CHUNK_SIZE],
            eof: false,
        };
        let first = state.next_chunk().await.inspect_err(|e| {
            if e.is_authentication() {
                warn!(name = %name, "file failed authentication");
            }
        })?;
        debug!(name = %name, "opened encrypted file");

        let head = stream::iter(
            first
                .filter(|chunk| !chunk.is_empty())
                .map(Ok::<Bytes, VaultError>),
        );
        let rest = stream::try_unfold(state, |mut state| async move {
            let chunk = state.next_chunk().await?;
            Ok::<_, VaultError>(chunk.map(|chunk| (chunk, state)))
        });
        Ok(head.chain(rest).boxed())
    }

    /// Decrypt a stored file into `output`. Returns the plaintext size.
    pub async fn download_to<W>(
        &self,
        name: &str,
        passphrase: Passphrase,
        output: &mut W,
    ) -> VaultResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut plaintext = self.download(name, passphrase).await?;
        let mut total = 0u64;
        while let Some(chunk) = plaintext.next().await {
            let chunk = chunk?;
            output.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        output.flush().await?;
        Ok(total)
    }

    pub async fn delete(&self, name: &str) -> VaultResult<bool> {
        let removed = self.store.delete(name).await?;
        info!(name = %name, removed, "deleted file");
        Ok(removed)
    }

    pub async fn exists(&self, name: &str) -> VaultResult<bool> {
        self.store.exists(name).await
    }
}

async fn encrypt_into<R, W>(
    mut input: R,
    header: StreamHeader,
    mut encryptor: StreamEncryptor,
    mut output: W,
) -> VaultResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    output.write_all(&header.to_bytes()).await?;

    let mut buf = Zeroizing::new(vec![0u8; CHUNK_SIZE]);
    let mut total = 0u64;
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
        let sealed = encryptor.update(&buf[..n]).map_err(map_crypto_error)?;
        output.write_all(&sealed).await?;
    }
    let last = encryptor.finish().map_err(map_crypto_error)?;
    output.write_all(&last).await?;

    output.shutdown().await?;
    Ok(total)
}

const HEADER_READ_SIZE: usize = 64;

/// Read the blob header; returns it with any body bytes read past it.
async fn read_header(reader: &mut BlobReader) -> VaultResult<(StreamHeader, Vec<u8>)> {
    let mut bytes = Vec::with_capacity(HEADER_READ_SIZE);
    let mut buf = [0u8; HEADER_READ_SIZE];
    loop {
        if let Some((header, used)) = StreamHeader::parse(&bytes).map_err(map_crypto_error)? {
            bytes.drain(..used);
            return Ok((header, bytes));
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(VaultError::Authentication);
        }
        bytes.extend_from_slice(&buf[..n]);
    }
}

/// Decryption state for one blob; owns the store's reader.
struct OpenBlob {
    reader: BlobReader,
    decryptor: StreamDecryptor,
    buf: Vec<u8>,
    eof: bool,
}

impl OpenBlob {
    async fn next_chunk(&mut self) -> VaultResult<Option<Bytes>> {
        loop {
            if let Some(plain) = self
                .decryptor
                .next_chunk(self.eof)
                .map_err(map_crypto_error)?
            {
                return Ok(Some(Bytes::copy_from_slice(&plain)));
            }
            if self.decryptor.is_finished() {
                return Ok(None);
            }
            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.decryptor.update(&self.buf[..n]);
            }
        }
    }
}
