use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use ferrix_compat::store_path::{StorePath, STORE_DIR_WITH_SLASH};
use tracing::{debug, instrument};
use url::Url;

use super::{attrs_without, decoded_path, parse_int_param, query_map, set_query};
use crate::{
    attrs::{get_str, Attr, Attrs},
    Error, FetchContext, Input, InputScheme,
};

/// Local directories (or files), copied into the store as they are.
pub struct PathInputScheme;

const ALLOWED_ATTRS: &[&str] = &["path", "rev", "revCount", "lastModified", "narHash"];

/// Makes `path` absolute against `base` and drops `.` and `..`
/// components, without touching the filesystem.
pub(crate) fn absolute(path: &Path, base: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in base.join(path).components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            c => out.push(c),
        }
    }
    out
}

/// The newest modification time of anything in the tree at `path`.
fn newest_mtime(path: &Path) -> Result<u64, Error> {
    let mut newest = 0;
    for entry in walkdir::WalkDir::new(path) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let mtime = entry
            .metadata()
            .map_err(|e| Error::Io(e.into()))?
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        newest = newest.max(mtime);
    }
    Ok(newest)
}

impl PathInputScheme {
    /// Resolves the `path` attribute, which may be relative to the input's
    /// parent directory.
    fn abs_path(&self, input: &Input<'_>) -> Result<PathBuf, Error> {
        let path = PathBuf::from(get_str(input.attrs(), "path")?);
        if path.is_absolute() {
            return Ok(absolute(&path, Path::new("/")));
        }

        let parent = input.parent().ok_or_else(|| {
            Error::Malformed(format!(
                "cannot fetch input '{input}' because it uses a relative path"
            ))
        })?;
        let abs = absolute(&path, parent);

        // a relative path in a store path must stay inside it
        if let Ok(in_store) = parent.strip_prefix(STORE_DIR_WITH_SLASH) {
            if let Some(Component::Normal(name)) = in_store.components().next() {
                let store_path = Path::new(STORE_DIR_WITH_SLASH).join(name);
                if !abs.starts_with(&store_path) {
                    return Err(Error::Malformed(format!(
                        "relative path '{}' points outside of its parent's store path '{}'",
                        path.display(),
                        store_path.display()
                    )));
                }
            }
        }
        Ok(abs)
    }
}

#[async_trait]
impl InputScheme for PathInputScheme {
    fn scheme_type(&self) -> &'static str {
        "path"
    }

    fn allowed_attrs(&self) -> &'static [&'static str] {
        ALLOWED_ATTRS
    }

    fn input_from_url(&self, url: &Url) -> Result<Option<Attrs>, Error> {
        if url.scheme() != "path" {
            return Ok(None);
        }
        if let Some(host) = url.host_str().filter(|h| !h.is_empty()) {
            return Err(Error::bad_url(
                url,
                format!("path URLs should not have an authority ('{host}')"),
            ));
        }

        let mut attrs = Attrs::new();
        attrs.insert("type".into(), "path".into());
        attrs.insert("path".into(), decoded_path(url)?.into());

        for (name, value) in query_map(url) {
            let attr = match name.as_str() {
                "rev" | "narHash" => Attr::from(value),
                "revCount" | "lastModified" => Attr::from(parse_int_param(url, &name, &value)?),
                _ => {
                    return Err(Error::bad_url(
                        url,
                        format!("unsupported parameter '{name}'"),
                    ))
                }
            };
            attrs.insert(name, attr);
        }
        Ok(Some(attrs))
    }

    fn preprocess_attrs(&self, attrs: Attrs) -> Result<Attrs, Error> {
        get_str(&attrs, "path")?;
        Ok(attrs)
    }

    fn to_url(&self, input: &Input<'_>) -> Result<Url, Error> {
        let path = get_str(input.attrs(), "path")?;
        let mut url =
            Url::parse(&format!("path:{path}")).map_err(|e| Error::bad_url(path, e))?;
        set_query(&mut url, attrs_without(input.attrs(), &["type", "path"]));
        Ok(url)
    }

    fn has_all_info(&self, _input: &Input<'_>) -> bool {
        true
    }

    fn get_source_path(&self, input: &Input<'_>) -> Option<PathBuf> {
        self.abs_path(input).ok()
    }

    async fn put_file(
        &self,
        input: &Input<'_>,
        path: &Path,
        contents: &[u8],
        _commit_msg: Option<&str>,
    ) -> Result<(), Error> {
        let dest = self.abs_path(input)?.join(path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, contents).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(input = %input), err)]
    async fn fetch(
        &self,
        ctx: &FetchContext,
        input: &Input<'_>,
    ) -> Result<(StorePath, Attrs), Error> {
        let abs_path = self.abs_path(input)?;
        if tokio::fs::symlink_metadata(&abs_path).await.is_err() {
            return Err(Error::NotFound(format!(
                "path '{}' does not exist",
                abs_path.display()
            )));
        }

        let last_modified = tokio::task::spawn_blocking({
            let abs_path = abs_path.clone();
            move || newest_mtime(&abs_path)
        })
        .await??;

        debug!(path = %abs_path.display(), "copying path to the store");
        let store_path = ctx
            .store
            .add_to_store_recursive(&input.get_name(), &abs_path, None)
            .await?;

        let mut attrs = input.to_attrs();
        attrs.insert("lastModified".into(), Attr::from(last_modified));
        Ok((store_path, attrs))
    }

    fn is_locked_by_rev(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::{Path, PathBuf},
        sync::{atomic::AtomicU64, Arc},
    };

    use filetime::FileTime;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::absolute;
    use crate::{
        attrs::{attrs, Attr},
        tests::fixtures::context_with_clock,
        ErrorKind, Registry,
    };

    #[rstest]
    #[case::plain("path:/foo/bar", "path:/foo/bar")]
    #[case::params(
        "path:/foo?revCount=2&lastModified=5&rev=7f8d3a8c1a2a6f5d2e0c9b1f0e4d3c2b1a098765",
        "path:/foo?lastModified=5&rev=7f8d3a8c1a2a6f5d2e0c9b1f0e4d3c2b1a098765&revCount=2"
    )]
    #[case::spaces("path:/foo%20bar", "path:/foo%20bar")]
    fn url_roundtrip(#[case] url: &str, #[case] expected: &str) {
        let registry = Registry::with_builtin_schemes();
        let input = registry.input_from_url(url).unwrap();
        assert_eq!("path", input.get_type());
        assert_eq!(expected, input.to_url_string().unwrap());
    }

    #[test]
    fn parsed_attrs() {
        let registry = Registry::with_builtin_schemes();
        let input = registry
            .input_from_url("path:/foo%20bar?lastModified=5")
            .unwrap();
        assert_eq!(
            &attrs([
                ("type", Attr::from("path")),
                ("path", Attr::from("/foo bar")),
                ("lastModified", Attr::from(5u64)),
            ]),
            input.attrs()
        );
    }

    #[rstest]
    #[case::authority("path://host/foo")]
    #[case::unknown_param("path:/foo?ref=main")]
    #[case::bad_int("path:/foo?revCount=many")]
    fn bad_urls(#[case] url: &str) {
        let registry = Registry::with_builtin_schemes();
        let err = registry.input_from_url(url).expect_err("must fail");
        assert_eq!(ErrorKind::Malformed, err.kind(), "{err}");
    }

    #[rstest]
    #[case::relative("b/c", "/a", "/a/b/c")]
    #[case::dots("./b/../c", "/a", "/a/c")]
    #[case::absolute("/x/y", "/a", "/x/y")]
    fn absolutise(#[case] path: &str, #[case] base: &str, #[case] expected: &str) {
        assert_eq!(PathBuf::from(expected), absolute(Path::new(path), Path::new(base)));
    }

    #[tokio::test]
    async fn fetch_sets_last_modified() {
        let (dir, ctx) = context_with_clock(Arc::new(AtomicU64::new(0))).await;
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("a"), "a").unwrap();
        std::fs::write(src.join("sub/b"), "b").unwrap();
        for (path, mtime) in [("a", 100), ("sub/b", 300), ("sub", 200), ("", 50)] {
            filetime::set_file_mtime(src.join(path), FileTime::from_unix_time(mtime, 0))
                .unwrap();
        }

        let registry = Registry::with_builtin_schemes();
        let input = registry
            .input_from_url(&format!("path:{}", src.display()))
            .unwrap();
        let (tree, locked) = input.fetch(&ctx).await.unwrap();

        assert_eq!(Some(300), locked.get_last_modified().unwrap());
        assert_eq!(
            "b",
            std::fs::read_to_string(tree.actual_path.unwrap().join("sub/b")).unwrap()
        );
    }

    #[tokio::test]
    async fn relative_paths_need_a_parent() {
        let (dir, ctx) = context_with_clock(Arc::new(AtomicU64::new(0))).await;
        std::fs::create_dir(dir.path().join("src")).unwrap();

        let registry = Registry::with_builtin_schemes();
        let mut input = registry
            .input_from_attrs(attrs([("type", "path"), ("path", "./src")]))
            .unwrap();
        assert!(input.fetch(&ctx).await.is_err());

        input.set_parent(Some(dir.path().to_path_buf()));
        assert_eq!(Some(dir.path().join("src")), input.get_source_path());
        input.fetch(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn relative_paths_stay_in_their_store_path() {
        let (_dir, ctx) = context_with_clock(Arc::new(AtomicU64::new(0))).await;
        let registry = Registry::with_builtin_schemes();
        let mut input = registry
            .input_from_attrs(attrs([("type", "path"), ("path", "../../other")]))
            .unwrap();
        input.set_parent(Some(
            "/nix/store/00bgd045z0d4icpbc2yyz4gx48ak44la-source/sub".into(),
        ));
        let err = input.fetch(&ctx).await.expect_err("must fail");
        assert!(err.to_string().contains("points outside"), "{err}");
    }

    #[tokio::test]
    async fn missing_path() {
        let (dir, ctx) = context_with_clock(Arc::new(AtomicU64::new(0))).await;
        let registry = Registry::with_builtin_schemes();
        let input = registry
            .input_from_url(&format!("path:{}", dir.path().join("nope").display()))
            .unwrap();
        let err = input.fetch(&ctx).await.expect_err("must fail");
        assert_eq!(ErrorKind::NotFound, err.kind());
    }

    #[tokio::test]
    async fn put_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::with_builtin_schemes();
        let input = registry
            .input_from_url(&format!("path:{}", dir.path().display()))
            .unwrap();
        input
            .put_file(Path::new("sub/flake.lock"), b"{}", Some("ignored"))
            .await
            .unwrap();
        assert_eq!(
            "{}",
            std::fs::read_to_string(dir.path().join("sub/flake.lock")).unwrap()
        );
        assert!(input.put_file(Path::new("../x"), b"", None).await.is_err());
    }
}
