use std::io;

use async_compression::tokio::bufread::{BzDecoder, GzipDecoder, XzDecoder, ZstdDecoder};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BZIP2_MAGIC: [u8; 3] = *b"BZh";
const XZ_MAGIC: [u8; 6] = [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl Algorithm {
    fn from_magic(magic: &[u8]) -> Option<Self> {
        if magic.starts_with(&GZIP_MAGIC) {
            Some(Self::Gzip)
        } else if magic.starts_with(&BZIP2_MAGIC) {
            Some(Self::Bzip2)
        } else if magic.starts_with(&XZ_MAGIC) {
            Some(Self::Xz)
        } else if magic.starts_with(&ZSTD_MAGIC) {
            Some(Self::Zstd)
        } else {
            None
        }
    }
}

/// Wraps `r` in the decoder matching the magic bytes at its start. Data
/// without a known magic is passed through unchanged.
pub(crate) async fn decompressed<'a, R>(mut r: R) -> io::Result<Box<dyn AsyncRead + Unpin + Send + 'a>>
where
    R: AsyncBufRead + Unpin + Send + 'a,
{
    // Peeking doesn't consume, the decoder sees the magic again.
    let algorithm = Algorithm::from_magic(r.fill_buf().await?);

    Ok(match algorithm {
        Some(Algorithm::Gzip) => Box::new(GzipDecoder::new(r)),
        Some(Algorithm::Bzip2) => Box::new(BzDecoder::new(r)),
        Some(Algorithm::Xz) => Box::new(XzDecoder::new(r)),
        Some(Algorithm::Zstd) => Box::new(ZstdDecoder::new(r)),
        None => Box::new(r),
    })
}
