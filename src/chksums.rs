use crate::errors::*;
use digest::Digest;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use std::pin::Pin;
use std::task::Poll;
use tokio::io::{self, AsyncRead, ReadBuf};

/// Running digest over one of the algorithms a repomd checksum can declare.
#[derive(Debug, Clone)]
pub enum Checksum {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Checksum {
    /// Select by the `type` attribute of a `<checksum>` element. Old
    /// repositories declare plain `"sha"` for sha1.
    pub fn for_type(checksum_type: &str) -> Result<Self> {
        match checksum_type {
            "sha" | "sha1" => Ok(Checksum::Sha1(Sha1::new())),
            "sha256" => Ok(Checksum::Sha256(Sha256::new())),
            "sha512" => Ok(Checksum::Sha512(Sha512::new())),
            other => Err(Error::InvalidSnapshot(format!(
                "unsupported checksum type {other:?}"
            ))),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Checksum::Sha1(h) => h.update(data),
            Checksum::Sha256(h) => h.update(data),
            Checksum::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Checksum::Sha1(h) => hex::encode(h.finalize()),
            Checksum::Sha256(h) => hex::encode(h.finalize()),
            Checksum::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// AsyncRead adapter that feeds every chunk it passes through into a
/// [`Checksum`], so streamed downloads are hashed without a second pass.
pub struct Hasher<R> {
    reader: R,
    checksum: Checksum,
    size: u64,
}

impl<R: AsyncRead + Unpin> AsyncRead for Hasher<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        if let Poll::Ready(x) = Pin::new(&mut self.reader).poll_read(cx, buf) {
            let buf = buf.filled();
            let new = &buf[before..];
            self.checksum.update(new);
            self.size = self.size.saturating_add(new.len() as u64);
            Poll::Ready(x)
        } else {
            Poll::Pending
        }
    }
}

impl<R> Hasher<R> {
    pub fn new(reader: R, checksum: Checksum) -> Self {
        Hasher {
            reader,
            checksum,
            size: 0,
        }
    }

    pub fn digest(self) -> (R, String, u64) {
        (self.reader, self.checksum.finalize_hex(), self.size)
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut sha256 = Sha256::new();
    sha256.update(data);
    hex::encode(sha256.finalize())
}
