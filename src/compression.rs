use async_compression::tokio::bufread::{BzDecoder, GzipDecoder, XzDecoder};
use std::pin::Pin;
use std::task::Poll;
use tokio::io::{self, AsyncBufRead, AsyncRead, ReadBuf};

pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
pub const BZIP2_MAGIC: [u8; 3] = [0x42, 0x5a, 0x68];
pub const XZ_MAGIC: [u8; 5] = [0xfd, 0x37, 0x7a, 0x58, 0x5a];

/// First 16 bytes of every SQLite database file.
pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Compression format of a primary_db payload, identified by magic bytes
/// rather than by file extension (mirrors lie about extensions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gz,
    Bz2,
    Xz,
}

impl Compression {
    pub fn detect(header: &[u8]) -> Self {
        if header.starts_with(&GZIP_MAGIC) {
            Compression::Gz
        } else if header.starts_with(&BZIP2_MAGIC) {
            Compression::Bz2
        } else if header.starts_with(&XZ_MAGIC) {
            Compression::Xz
        } else {
            Compression::None
        }
    }
}

/// Streaming decoder over a buffered reader, one variant per recognized
/// format. `Compression::None` passes bytes through untouched so the caller
/// never needs a separate code path for uncompressed payloads.
pub struct Decompressor<R> {
    inner: Decoder<R>,
}

enum Decoder<R> {
    Passthrough(R),
    Gz(GzipDecoder<R>),
    Bz2(BzDecoder<R>),
    Xz(XzDecoder<R>),
}

impl<R: AsyncBufRead> Decompressor<R> {
    pub fn new(compression: Compression, reader: R) -> Self {
        let inner = match compression {
            Compression::None => Decoder::Passthrough(reader),
            Compression::Gz => Decoder::Gz(GzipDecoder::new(reader)),
            Compression::Bz2 => {
                let mut decoder = BzDecoder::new(reader);
                // repodata generators concatenate bzip2 streams
                decoder.multiple_members(true);
                Decoder::Bz2(decoder)
            }
            Compression::Xz => Decoder::Xz(XzDecoder::new(reader)),
        };
        Decompressor { inner }
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for Decompressor<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            Decoder::Passthrough(r) => Pin::new(r).poll_read(cx, buf),
            Decoder::Gz(r) => Pin::new(r).poll_read(cx, buf),
            Decoder::Bz2(r) => Pin::new(r).poll_read(cx, buf),
            Decoder::Xz(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_detect() {
        assert_eq!(Compression::detect(&[0x1f, 0x8b, 0x08]), Compression::Gz);
        assert_eq!(Compression::detect(b"BZh91AY"), Compression::Bz2);
        assert_eq!(
            Compression::detect(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]),
            Compression::Xz
        );
        assert_eq!(Compression::detect(SQLITE_MAGIC), Compression::None);
        assert_eq!(Compression::detect(&[]), Compression::None);
        assert_eq!(Compression::detect(&[0x1f]), Compression::None);
    }

    #[tokio::test]
    async fn test_plain_passthrough() {
        let data = b"SQLite format 3\0and the rest".as_slice();
        let mut reader = Decompressor::new(Compression::detect(data), data);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }
}
