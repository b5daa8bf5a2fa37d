use async_compression::tokio::bufread::{
    BzDecoder, BzEncoder, GzipDecoder, GzipEncoder, XzDecoder, XzEncoder, ZstdDecoder,
    ZstdEncoder,
};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::Error;

/// Compression methods NAR files can be written with.
pub const SUPPORTED: &[&str] = &["none", "xz", "bzip2", "gzip", "zstd"];

async fn read_all<R: AsyncRead + Unpin>(mut r: R) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    r.read_to_end(&mut out).await?;
    Ok(out)
}

fn unsupported(method: &str) -> Error {
    Error::InvalidRequest(format!("unsupported compression: {method}"))
}

pub async fn compress(method: Option<&str>, data: &[u8]) -> Result<Vec<u8>, Error> {
    match method {
        None | Some("none") => Ok(data.to_vec()),
        Some("xz") => read_all(XzEncoder::new(data)).await,
        Some("bzip2") => read_all(BzEncoder::new(data)).await,
        Some("gzip") => read_all(GzipEncoder::new(data)).await,
        Some("zstd") => read_all(ZstdEncoder::new(data)).await,
        Some(other) => Err(unsupported(other)),
    }
}

pub async fn decompress(method: Option<&str>, data: &[u8]) -> Result<Vec<u8>, Error> {
    match method {
        None | Some("none") => Ok(data.to_vec()),
        Some("xz") => read_all(XzDecoder::new(data)).await,
        Some("bzip2") => read_all(BzDecoder::new(data)).await,
        Some("gzip") => read_all(GzipDecoder::new(data)).await,
        Some("zstd") => read_all(ZstdDecoder::new(data)).await,
        Some(other) => Err(unsupported(other)),
    }
}
