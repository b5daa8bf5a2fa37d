use async_trait::async_trait;
use ferrix_compat::store_path::StorePath;
use tracing::{debug, instrument};
use url::Url;

use super::{parse_int_param, query_map, set_query};
use crate::{
    attrs::{get_str, Attr, Attrs},
    download::{download_file, download_tarball},
    Error, FetchContext, Input, InputScheme,
};

const TRANSPORTS: &[&str] = &["file", "http", "https"];

const ARCHIVE_EXTENSIONS: &[&str] = &[
    ".zip", ".tar", ".tgz", ".tar.gz", ".tar.xz", ".tar.bz2", ".tar.zst",
];

const ALLOWED_ATTRS: &[&str] = &[
    "url",
    "narHash",
    "name",
    "unpack",
    "rev",
    "revCount",
    "lastModified",
];

/// Whether `kind` was asked for a tarball (unpacked into a tree) or a
/// single file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CurlKind {
    Tarball,
    File,
}

/// Files and tarballs downloaded over HTTP(S) or read from `file://` URLs.
///
/// Explicit `tarball+` and `file+` URL schemes select the kind, plain URLs
/// are tarballs if their path has an archive extension.
pub struct CurlInputScheme {
    kind: CurlKind,
}

fn has_archive_extension(path: &str) -> bool {
    ARCHIVE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

fn parse_bool_param(url: &Url, name: &str, value: &str) -> Result<bool, Error> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(Error::bad_url(
            url,
            format!("'{name}' must be a Boolean, got '{value}'"),
        )),
    }
}

impl CurlInputScheme {
    pub fn new(kind: CurlKind) -> Self {
        Self { kind }
    }

    fn name(&self) -> &'static str {
        match self.kind {
            CurlKind::Tarball => "tarball",
            CurlKind::File => "file",
        }
    }

    /// The kind a URL without an explicit kind prefix is taken as.
    fn plain_kind(url: &Url) -> CurlKind {
        if has_archive_extension(url.path()) {
            CurlKind::Tarball
        } else {
            CurlKind::File
        }
    }

    /// Builds the attributes for `url`, fetched with `transport`. Query
    /// parameters naming attributes are moved out of the URL.
    fn url_to_attrs(&self, url: &Url, transport: &str) -> Result<Attrs, Error> {
        let rest = &url.as_str()[url.scheme().len()..];
        let mut transport_url = Url::parse(&format!("{transport}{rest}"))
            .map_err(|e| Error::bad_url(url, e))?;

        let mut attrs = Attrs::new();
        attrs.insert("type".into(), Attr::from(self.name()));

        let mut query = query_map(url);
        for name in ALLOWED_ATTRS.iter().filter(|n| **n != "url") {
            if let Some(value) = query.remove(*name) {
                let attr = match *name {
                    "revCount" | "lastModified" => Attr::from(parse_int_param(url, name, &value)?),
                    "unpack" => Attr::from(parse_bool_param(url, name, &value)?),
                    _ => Attr::from(value),
                };
                attrs.insert(name.to_string(), attr);
            }
        }

        let remaining: Vec<(String, Attr)> = query
            .into_iter()
            .map(|(k, v)| (k, Attr::from(v)))
            .collect();
        set_query(
            &mut transport_url,
            remaining.iter().map(|(k, v)| (k.as_str(), v)),
        );
        attrs.insert("url".into(), Attr::from(transport_url.to_string()));
        Ok(attrs)
    }
}

#[async_trait]
impl InputScheme for CurlInputScheme {
    fn scheme_type(&self) -> &'static str {
        self.name()
    }

    fn allowed_attrs(&self) -> &'static [&'static str] {
        ALLOWED_ATTRS
    }

    fn input_from_url(&self, url: &Url) -> Result<Option<Attrs>, Error> {
        let (kind, transport) = match url.scheme().split_once('+') {
            Some((kind, transport)) if kind == self.name() => (self.kind, transport),
            Some(_) => return Ok(None),
            None => (Self::plain_kind(url), url.scheme()),
        };
        if kind != self.kind || !TRANSPORTS.contains(&transport) {
            return Ok(None);
        }
        self.url_to_attrs(url, transport).map(Some)
    }

    fn preprocess_attrs(&self, attrs: Attrs) -> Result<Attrs, Error> {
        let url = get_str(&attrs, "url")?;
        Url::parse(url).map_err(|e| Error::bad_url(url, e))?;
        Ok(attrs)
    }

    fn to_url(&self, input: &Input<'_>) -> Result<Url, Error> {
        let url_str = get_str(input.attrs(), "url")?;
        let mut url = Url::parse(url_str).map_err(|e| Error::bad_url(url_str, e))?;

        if Self::plain_kind(&url) != self.kind {
            let rest = &url_str[url.scheme().len()..];
            url = Url::parse(&format!("{}+{}{rest}", self.name(), url.scheme()))
                .map_err(|e| Error::bad_url(url_str, e))?;
        }

        if let Some(nar_hash) = input.get_nar_hash()? {
            url.query_pairs_mut()
                .append_pair("narHash", &nar_hash.to_sri_string());
        }
        Ok(url)
    }

    fn has_all_info(&self, _input: &Input<'_>) -> bool {
        true
    }

    #[instrument(skip_all, fields(input = %input), err)]
    async fn fetch(
        &self,
        ctx: &FetchContext,
        input: &Input<'_>,
    ) -> Result<(StorePath, Attrs), Error> {
        let url = get_str(input.attrs(), "url")?;

        match self.kind {
            CurlKind::File => {
                let file = download_file(ctx, url, &input.get_name(), false, &[]).await?;
                Ok((file.store_path, input.to_attrs()))
            }
            CurlKind::Tarball => {
                let result = download_tarball(ctx, url, &input.get_name(), false, &[]).await?;

                let mut attrs = match &result.immutable_url {
                    Some(immutable) => {
                        let immutable = Url::parse(url)
                            .and_then(|base| base.join(immutable))
                            .map_err(|e| Error::bad_url(immutable, e))?;
                        debug!(url = %immutable, "following immutable link");
                        let scheme = immutable.scheme();
                        let parsed = if scheme.contains('+') {
                            self.input_from_url(&immutable)?
                        } else if TRANSPORTS.contains(&scheme) {
                            Some(self.url_to_attrs(&immutable, scheme)?)
                        } else {
                            None
                        };
                        parsed.ok_or_else(|| {
                            Error::Unsupported(format!(
                                "tarball 'Link' headers that redirect to non-tarball URLs ('{immutable}')"
                            ))
                        })?
                    }
                    None => input.to_attrs(),
                };
                if let Some(name) = input.attrs().get("name") {
                    attrs.insert("name".into(), name.clone());
                }

                if result.last_modified != 0 {
                    attrs
                        .entry("lastModified".into())
                        .or_insert(Attr::from(result.last_modified));
                }
                Ok((result.tree.store_path, attrs))
            }
        }
    }
}
