use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use tracing::{debug, instrument, warn};
use url::Url;

use super::BinaryCacheBackend;
use crate::Error;

/// A read-only binary cache served over HTTP, like cache.nixos.org.
pub struct HttpBinaryCache {
    base_url: Url,
    http_client: reqwest::Client,
}

impl HttpBinaryCache {
    pub fn new(mut base_url: Url) -> Self {
        // Url::join replaces the last path segment unless there's a trailing slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Self {
            base_url,
            http_client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        self.base_url.join(path).map_err(|e| {
            warn!(err = %e, "unable to join URL");
            Error::InvalidRequest(format!("unable to join {path}: {e}"))
        })
    }
}

/// 403 is what S3 returns for missing objects when listing isn't allowed,
/// so it's treated the same as 404.
fn is_absent(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::FORBIDDEN
}

#[async_trait]
impl BinaryCacheBackend for HttpBinaryCache {
    fn uri(&self) -> String {
        self.base_url.as_str().trim_end_matches('/').to_string()
    }

    #[instrument(skip(self), err)]
    async fn file_exists(&self, path: &str) -> Result<bool, Error> {
        let resp = self
            .http_client
            .head(self.url(path)?)
            .send()
            .await
            .map_err(|e| Error::StorageError(format!("unable to send HEAD request: {e}")))?;

        match resp.status() {
            status if is_absent(status) => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(Error::StorageError(format!(
                "unexpected status {status} for {path}"
            ))),
        }
    }

    async fn upsert_file(&self, _path: &str, _data: Bytes, _mime_type: &str) -> Result<(), Error> {
        Err(Error::ReadOnly(self.uri()))
    }

    #[instrument(skip(self), err)]
    async fn get_file(&self, path: &str) -> Result<Option<Bytes>, Error> {
        let url = self.url(path)?;
        debug!(url = %url, "fetching");

        let resp = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::StorageError(format!("unable to send GET request: {e}")))?;

        if is_absent(resp.status()) {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::StorageError(format!(
                "unable to retrieve {path}, status {}",
                resp.status()
            )));
        }

        let body = resp.bytes().await.map_err(|e| {
            let e = e.without_url();
            warn!(err = %e, "failed to get response body");
            Error::StorageError(e.to_string())
        })?;
        Ok(Some(body))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };
    use url::Url;

    use super::HttpBinaryCache;
    use crate::{binary_cache::BinaryCacheBackend, Error};

    /// Serves `files` (path to status and body) over plain HTTP/1.1 until
    /// the test ends, returning the base URL.
    pub(crate) async fn serve(files: HashMap<&'static str, (u16, &'static [u8])>) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let files = files.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut len = 0;
                    while !buf[..len].windows(4).any(|w| w == b"\r\n\r\n") {
                        match sock.read(&mut buf[len..]).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => len += n,
                        }
                    }
                    let request = String::from_utf8_lossy(&buf[..len]);
                    let mut parts = request.split_whitespace();
                    let method = parts.next().unwrap_or_default().to_string();
                    let path = parts.next().unwrap_or_default().to_string();

                    let (status, body) = files
                        .get(path.trim_start_matches("/cache/"))
                        .copied()
                        .unwrap_or((404, b"not found".as_slice()));
                    let mut resp = format!(
                        "HTTP/1.1 {status} X\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                        body.len()
                    )
                    .into_bytes();
                    if method != "HEAD" {
                        resp.extend_from_slice(body);
                    }
                    let _ = sock.write_all(&resp).await;
                });
            }
        });

        Url::parse(&format!("http://{addr}/cache")).unwrap()
    }

    #[tokio::test]
    async fn statuses() {
        let base = serve(HashMap::from([
            ("present", (200, b"hello".as_slice())),
            ("forbidden", (403, b"".as_slice())),
            ("broken", (500, b"".as_slice())),
        ]))
        .await;
        let cache = HttpBinaryCache::new(base);

        assert_eq!(Some("hello".into()), cache.get_file("present").await.unwrap());
        assert!(cache.file_exists("present").await.unwrap());

        assert_eq!(None, cache.get_file("missing").await.unwrap());
        assert!(!cache.file_exists("missing").await.unwrap());
        assert_eq!(None, cache.get_file("forbidden").await.unwrap());

        cache.get_file("broken").await.expect_err("500 is an error");
    }

    #[tokio::test]
    async fn read_only() {
        let cache = HttpBinaryCache::new(Url::parse("http://127.0.0.1:1/cache").unwrap());
        assert_eq!("http://127.0.0.1:1/cache", cache.uri());
        assert!(matches!(
            cache.upsert_file("x", "".into(), "text/plain").await,
            Err(Error::ReadOnly(_))
        ));
    }
}
