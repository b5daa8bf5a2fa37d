//! Downloading files and tarballs into the store, memoized in the fetch
//! cache and revalidated with ETags once the TTL passed.

use std::path::{Path, PathBuf};

use ferrix_compat::store_path::StorePath;
use futures::{StreamExt, TryStreamExt};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{header, StatusCode};
use tokio::io::BufReader;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{
    attrs::{attrs, get_int, get_str, maybe_get_str, Attr, Attrs},
    decompression::decompressed,
    Error, FetchContext, Outcome, Tree,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadFileResult {
    pub store_path: StorePath,
    pub etag: String,
    /// The URL after following redirects.
    pub effective_url: String,
    /// A URL that will keep serving the same contents, if the server
    /// announced one in a `Link: <…>; rel="immutable"` header.
    pub immutable_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadTarballResult {
    pub tree: Tree,
    pub last_modified: u64,
    pub immutable_url: Option<String>,
}

struct Transfer {
    etag: String,
    effective_url: String,
    immutable_url: Option<String>,
    /// The server confirmed the expected ETag, nothing was written.
    not_modified: bool,
}

lazy_static! {
    static ref IMMUTABLE_LINK: Regex = Regex::new(r#"<([^>]*)>; rel="immutable""#).unwrap();
}

/// Drops potentially sensitive username and password from a URL.
pub(crate) fn redact_url(url: &Url) -> Url {
    let mut url = url.to_owned();
    if !url.username().is_empty() {
        let _ = url.set_username("redacted");
    }

    if url.password().is_some() {
        let _ = url.set_password(Some("redacted"));
    }

    url
}

/// Fetches `url` into the file `dest`. With an `expected_etag`, a matching
/// server answers without a body and `dest` is left alone.
async fn transfer(
    ctx: &FetchContext,
    url: &Url,
    headers: &[(String, String)],
    expected_etag: Option<&str>,
    dest: &Path,
) -> Outcome<Transfer> {
    if url.scheme() == "file" {
        let Ok(src) = url.to_file_path() else {
            return Outcome::Fatal(format!("invalid file URL '{url}'"));
        };
        return match tokio::fs::copy(&src, dest).await {
            Ok(_) => Outcome::Success(Transfer {
                etag: String::new(),
                effective_url: url.to_string(),
                immutable_url: None,
                not_modified: false,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Outcome::NotFound(format!("file '{}' does not exist", src.display()))
            }
            Err(e) => Outcome::Fatal(format!("cannot read '{}': {e}", src.display())),
        };
    }

    let mut request = ctx.http.get(url.clone());
    for (name, value) in headers {
        request = request.header(name, value);
    }
    if let Some(etag) = expected_etag {
        request = request.header(header::IF_NONE_MATCH, etag);
    }

    let redacted = redact_url(url);
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => return Outcome::Transient(format!("unable to download '{redacted}': {}", e.without_url())),
    };

    let status = response.status();
    let effective_url = response.url().to_string();
    let header_str = |name: header::HeaderName| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let immutable_url = header_str(header::LINK)
        .and_then(|link| IMMUTABLE_LINK.captures(&link).map(|c| c[1].to_string()));

    if status == StatusCode::NOT_MODIFIED {
        return Outcome::Success(Transfer {
            etag: expected_etag.unwrap_or_default().to_string(),
            effective_url,
            immutable_url,
            not_modified: true,
        });
    }
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return Outcome::NotFound(format!("'{redacted}' does not exist (HTTP {status})"));
    }
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        return Outcome::Transient(format!("unable to download '{redacted}': HTTP {status}"));
    }
    if !status.is_success() {
        return Outcome::Fatal(format!("unable to download '{redacted}': HTTP {status}"));
    }

    let etag = header_str(header::ETAG).unwrap_or_default();

    let copied = async {
        let mut file = tokio::fs::File::create(dest).await?;
        let mut body = tokio_util::io::StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.without_url())),
        );
        tokio::io::copy(&mut body, &mut file).await
    }
    .await;

    match copied {
        Ok(size) => {
            debug!(url = %redacted, size, "downloaded");
            Outcome::Success(Transfer {
                etag,
                effective_url,
                immutable_url,
                not_modified: false,
            })
        }
        Err(e) => Outcome::Transient(format!("error while downloading '{redacted}': {e}")),
    }
}

/// Downloads `url` and adds it to the store as a flat file named `name`.
///
/// A fresh cache entry is returned without touching the network. A stale
/// one is revalidated with its ETag, and used (with a warning) if the
/// server can't be reached.
#[instrument(skip_all, fields(url = %url, name = %name), err)]
pub async fn download_file(
    ctx: &FetchContext,
    url: &str,
    name: &str,
    locked: bool,
    headers: &[(String, String)],
) -> Result<DownloadFileResult, Error> {
    let parsed = Url::parse(url).map_err(|e| Error::bad_url(url, e))?;
    let key = attrs([("type", "file"), ("url", url), ("name", name)]);

    let cached = ctx.cache.lookup_expired(ctx.store.as_ref(), &key).await?;
    let use_cached = |store_path: StorePath, info: &Attrs| -> Result<DownloadFileResult, Error> {
        Ok(DownloadFileResult {
            store_path,
            etag: get_str(info, "etag")?.to_string(),
            effective_url: get_str(info, "url")?.to_string(),
            immutable_url: maybe_get_str(info, "immutableUrl")?.map(str::to_string),
        })
    };

    if let Some(entry) = &cached {
        if !entry.expired {
            debug!("using cached download");
            return use_cached(entry.store_path.clone(), &entry.info);
        }
    }

    let tmp = tempfile::tempdir()?;
    let dest = tmp.path().join("download");
    let expected_etag = match &cached {
        Some(entry) => Some(get_str(&entry.info, "etag")?),
        None => None,
    };

    info!(url = %redact_url(&parsed), "downloading");
    let transfer = match transfer(ctx, &parsed, headers, expected_etag, &dest).await {
        Outcome::Success(transfer) => transfer,
        Outcome::Transient(msg) => match &cached {
            Some(entry) => {
                warn!(err = %msg, "using cached version");
                return use_cached(entry.store_path.clone(), &entry.info);
            }
            None => return Err(Error::Transient(msg)),
        },
        Outcome::NotFound(msg) => return Err(Error::NotFound(msg)),
        Outcome::Fatal(msg) => return Err(Error::Fatal(msg)),
    };

    let mut info = attrs([
        ("etag", transfer.etag.as_str()),
        ("url", transfer.effective_url.as_str()),
    ]);
    if let Some(immutable_url) = &transfer.immutable_url {
        info.insert("immutableUrl".into(), Attr::from(immutable_url.as_str()));
    }

    let store_path = match (&cached, transfer.not_modified) {
        (Some(entry), true) => {
            debug!("server confirmed cached version");
            entry.store_path.clone()
        }
        (None, true) => {
            return Err(Error::Fatal(format!(
                "server answered 'not modified' for '{url}' without a cached version"
            )))
        }
        (_, false) => ctx.store.add_to_store_flat(name, &dest).await?,
    };

    ctx.cache.add(&key, &info, &store_path, locked).await?;
    if transfer.effective_url != url {
        let effective_key = attrs([
            ("type", "file"),
            ("url", transfer.effective_url.as_str()),
            ("name", name),
        ]);
        ctx.cache.add(&effective_key, &info, &store_path, locked).await?;
    }

    Ok(DownloadFileResult {
        store_path,
        etag: transfer.etag,
        effective_url: transfer.effective_url,
        immutable_url: transfer.immutable_url,
    })
}

/// Unpacks the (possibly compressed) tarball at `src` into `dest`,
/// returning the newest modification time recorded in the archive.
async fn unpack_tarball(src: &Path, dest: &Path) -> Result<u64, Error> {
    let file = tokio::fs::File::open(src).await?;
    let reader = decompressed(BufReader::new(file)).await?;
    let mut archive = tokio_tar::Archive::new(reader);

    let mut newest = 0;
    let mut entries = archive.entries()?;
    while let Some(entry) = entries.next().await {
        let mut entry = entry?;
        newest = newest.max(entry.header().mtime()?);
        entry.unpack_in(dest).await?;
    }
    Ok(newest)
}

/// Returns the single entry in `dir`.
fn single_entry(dir: &Path, url: &str) -> Result<PathBuf, Error> {
    let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    match (entries.pop(), entries.is_empty()) {
        (Some(entry), true) => Ok(entry.path()),
        _ => Err(Error::Malformed(format!(
            "tarball '{url}' contains an unexpected number of top-level files"
        ))),
    }
}

/// Downloads a tarball and adds its single top-level entry to the store,
/// recursively, as `name`.
///
/// If the download's ETag didn't change, the previously unpacked path is
/// reused.
#[instrument(skip_all, fields(url = %url, name = %name), err)]
pub async fn download_tarball(
    ctx: &FetchContext,
    url: &str,
    name: &str,
    locked: bool,
    headers: &[(String, String)],
) -> Result<DownloadTarballResult, Error> {
    let key = attrs([("type", "tarball"), ("url", url), ("name", name)]);
    let cached = ctx.cache.lookup_expired(ctx.store.as_ref(), &key).await?;

    let tree = |store_path: StorePath| Tree {
        actual_path: ctx.store.real_path(&store_path),
        store_path,
    };

    if let Some(entry) = &cached {
        if !entry.expired {
            debug!("using cached tarball");
            return Ok(DownloadTarballResult {
                tree: tree(entry.store_path.clone()),
                last_modified: get_int(&entry.info, "lastModified")?,
                immutable_url: maybe_get_str(&entry.info, "immutableUrl")?.map(str::to_string),
            });
        }
    }

    let file = download_file(ctx, url, name, locked, headers).await?;

    let unchanged = match &cached {
        Some(entry) if !file.etag.is_empty() => get_str(&entry.info, "etag")? == file.etag,
        _ => false,
    };

    let (store_path, last_modified) = match &cached {
        Some(entry) if unchanged => {
            debug!(etag = %file.etag, "tarball unchanged, reusing unpacked path");
            (
                entry.store_path.clone(),
                get_int(&entry.info, "lastModified")?,
            )
        }
        _ => {
            let archive = ctx.store.real_path(&file.store_path).ok_or_else(|| {
                Error::Fatal(format!("store '{}' has no local files to unpack", ctx.store.uri()))
            })?;

            let tmp = tempfile::tempdir()?;
            let last_modified = unpack_tarball(&archive, tmp.path()).await?;
            let top = single_entry(tmp.path(), url)?;

            let store_path = ctx.store.add_to_store_recursive(name, &top, None).await?;
            (store_path, last_modified)
        }
    };

    let mut info = attrs([
        ("lastModified", Attr::from(last_modified)),
        ("etag", Attr::from(file.etag.as_str())),
    ]);
    if let Some(immutable_url) = &file.immutable_url {
        info.insert("immutableUrl".into(), Attr::from(immutable_url.as_str()));
    }
    ctx.cache.add(&key, &info, &store_path, locked).await?;

    Ok(DownloadTarballResult {
        tree: tree(store_path),
        last_modified,
        immutable_url: file.immutable_url,
    })
}
