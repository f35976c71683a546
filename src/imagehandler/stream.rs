use crate::secret_bytes::SecretBytes;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

/// A readable, seekable byte stream handed out for a single open image.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("network data is {size} bytes, larger than the limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
}

/// Produces the customized image for a base image and a network data payload.
///
/// `open` is called for every HTTP request and may block; callers run it off the async runtime.
pub trait StreamFactory: Send + Sync {
    /// Rejects payloads that `open` could never turn into an image.
    fn validate(&self, payload: &[u8]) -> Result<(), PayloadError>;

    fn open(&self, base_image: &Path, payload: &SecretBytes) -> io::Result<Box<dyn ReadSeek>>;

    /// Best-effort length of the image without building it.
    fn size_hint(&self, _base_image: &Path, _payload: &SecretBytes) -> Option<u64> {
        None
    }
}

/// Serves the base image with the network data appended after its last byte.
pub struct EmbeddedPayloadFactory {
    max_payload_bytes: usize,
}

impl EmbeddedPayloadFactory {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self { max_payload_bytes }
    }
}

impl StreamFactory for EmbeddedPayloadFactory {
    fn validate(&self, payload: &[u8]) -> Result<(), PayloadError> {
        if payload.len() > self.max_payload_bytes {
            return Err(PayloadError::TooLarge {
                size: payload.len(),
                limit: self.max_payload_bytes,
            });
        }
        Ok(())
    }

    fn open(&self, base_image: &Path, payload: &SecretBytes) -> io::Result<Box<dyn ReadSeek>> {
        let base = File::open(base_image)?;
        let base_len = base.metadata()?.len();
        Ok(Box::new(EmbeddedPayloadReader {
            base,
            base_len,
            payload: payload.clone(),
            position: 0,
        }))
    }

    fn size_hint(&self, base_image: &Path, payload: &SecretBytes) -> Option<u64> {
        let base_len = std::fs::metadata(base_image).ok()?.len();
        Some(base_len + payload.len() as u64)
    }
}

struct EmbeddedPayloadReader {
    base: File,
    base_len: u64,
    payload: SecretBytes,
    position: u64,
}

impl EmbeddedPayloadReader {
    fn len(&self) -> u64 {
        self.base_len + self.payload.len() as u64
    }
}

impl Read for EmbeddedPayloadReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.position < self.base_len {
            let remaining = usize::try_from(self.base_len - self.position).unwrap_or(usize::MAX);
            let want = buf.len().min(remaining);
            self.base.seek(SeekFrom::Start(self.position))?;
            let n = self.base.read(&mut buf[..want])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "base image is shorter than when it was opened",
                ));
            }
            self.position += n as u64;
            return Ok(n);
        }

        let payload = self.payload.expose_secret();
        let offset = self.position - self.base_len;
        if offset >= payload.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(payload.len() - start);
        buf[..n].copy_from_slice(&payload[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for EmbeddedPayloadReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        self.position = target.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )
        })?;
        Ok(self.position)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory factory producing `prefix ++ payload`, counting every `open`.
    pub(crate) struct PrefixFactory {
        pub(crate) prefix: Vec<u8>,
        pub(crate) max_payload_bytes: usize,
        pub(crate) fail_open: bool,
        pub(crate) opens: AtomicUsize,
    }

    impl PrefixFactory {
        pub(crate) fn new(prefix: &[u8]) -> Self {
            Self {
                prefix: prefix.to_vec(),
                max_payload_bytes: 1024,
                fail_open: false,
                opens: AtomicUsize::new(0),
            }
        }

        pub(crate) fn expected(&self, payload: &[u8]) -> Vec<u8> {
            [self.prefix.as_slice(), payload].concat()
        }

        pub(crate) fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    impl StreamFactory for PrefixFactory {
        fn validate(&self, payload: &[u8]) -> Result<(), PayloadError> {
            if payload.len() > self.max_payload_bytes {
                return Err(PayloadError::TooLarge {
                    size: payload.len(),
                    limit: self.max_payload_bytes,
                });
            }
            Ok(())
        }

        fn open(&self, _base_image: &Path, payload: &SecretBytes) -> io::Result<Box<dyn ReadSeek>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(io::Error::other("stream generation failed"));
            }
            Ok(Box::new(Cursor::new(self.expected(payload.expose_secret()))))
        }

        fn size_hint(&self, _base_image: &Path, payload: &SecretBytes) -> Option<u64> {
            Some((self.prefix.len() + payload.len()) as u64)
        }
    }
}
