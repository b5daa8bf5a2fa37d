//! References to a source tree: an input plus a subdirectory inside it,
//! written as a URL (or a path) with an optional `dir` parameter and
//! fragment.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use percent_encoding::percent_decode_str;
use url::{form_urlencoded, Url};

use crate::{
    attrs::{attrs, maybe_get_str, Attr, Attrs},
    schemes::absolute,
    Error, FetchContext, Input, Registry, Tree,
};

#[derive(Clone, Debug, PartialEq)]
pub struct SourceRef<'r> {
    pub input: Input<'r>,
    /// Location of the tree inside the input, relative, possibly empty.
    pub subdir: String,
}

fn is_path_ref(url: &str) -> bool {
    url.starts_with('/') || url.starts_with('.') || !url.contains(':')
}

fn decode(s: &str) -> Result<String, Error> {
    percent_decode_str(s)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| Error::Malformed(e.to_string()))
}

impl<'r> SourceRef<'r> {
    /// Parses a reference that must not have a fragment.
    pub fn parse(registry: &'r Registry, url: &str, base_dir: Option<&Path>) -> Result<Self, Error> {
        let (source, fragment) = Self::parse_with_fragment(registry, url, base_dir)?;
        if !fragment.is_empty() {
            return Err(Error::Malformed(format!(
                "unexpected fragment '{fragment}' in reference '{url}'"
            )));
        }
        Ok(source)
    }

    /// Parses `url[#fragment]`, returning the decoded fragment separately.
    ///
    /// Relative paths need a `base_dir`. Paths inside a git working tree
    /// become `git+file` inputs for the whole repository, with the location
    /// inside it as the subdirectory.
    pub fn parse_with_fragment(
        registry: &'r Registry,
        url: &str,
        base_dir: Option<&Path>,
    ) -> Result<(Self, String), Error> {
        if is_path_ref(url) {
            Self::parse_path(registry, url, base_dir)
        } else {
            Self::parse_url(registry, url, base_dir)
        }
    }

    fn parse_url(
        registry: &'r Registry,
        url: &str,
        base_dir: Option<&Path>,
    ) -> Result<(Self, String), Error> {
        let mut parsed = Url::parse(url).map_err(|e| Error::bad_url(url, e))?;
        let fragment = decode(parsed.fragment().unwrap_or_default())?;
        parsed.set_fragment(None);

        let mut subdir = String::new();
        let query: Vec<(String, String)> = parsed
            .query_pairs()
            .filter_map(|(k, v)| {
                if k == "dir" {
                    subdir = v.into_owned();
                    None
                } else {
                    Some((k.into_owned(), v.into_owned()))
                }
            })
            .collect();
        parsed.set_query(None);
        if !query.is_empty() {
            parsed.query_pairs_mut().extend_pairs(query);
        }

        let mut input = registry.input_from_url(parsed.as_str())?;
        input.set_parent(base_dir.map(Path::to_path_buf));
        Ok((Self { input, subdir }, fragment))
    }

    fn parse_path(
        registry: &'r Registry,
        url: &str,
        base_dir: Option<&Path>,
    ) -> Result<(Self, String), Error> {
        let (rest, fragment) = url.split_once('#').unwrap_or((url, ""));
        let fragment = decode(fragment)?;
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut query: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        let dir = query
            .iter()
            .position(|(k, _)| k == "dir")
            .map(|i| query.remove(i).1);

        let Some(base_dir) = base_dir else {
            if !path.starts_with('/') {
                return Err(Error::bad_url(url, "not an absolute path"));
            }
            let path = absolute(&Path::new(path).join(dir.unwrap_or_default()), Path::new("/"));
            let input = registry.input_from_attrs(path_attrs(&path)?)?;
            return Ok((
                Self {
                    input,
                    subdir: String::new(),
                },
                fragment,
            ));
        };

        let path = absolute(Path::new(path), base_dir);
        if !path.is_dir() {
            return Err(Error::bad_url(
                url,
                format!("'{}' is not a directory", path.display()),
            ));
        }

        // look for the root of a git working tree
        let mut root = path.as_path();
        let mut inner = PathBuf::new();
        loop {
            if root.join(".git").exists() {
                if !inner.as_os_str().is_empty() && dir.is_some() {
                    return Err(Error::Contradictory(format!(
                        "reference '{url}' has an inconsistent 'dir' parameter"
                    )));
                }

                let mut repo_url = Url::from_file_path(root)
                    .map_err(|_| Error::bad_url(url, "cannot turn the path into a URL"))?;
                if !query.is_empty() {
                    repo_url.query_pairs_mut().extend_pairs(&query);
                }
                if root.join(".git/shallow").exists() {
                    repo_url.query_pairs_mut().append_pair("shallow", "1");
                }

                let input = registry.input_from_url(&format!("git+{repo_url}"))?;
                let subdir = match dir {
                    Some(dir) => dir,
                    None => inner.to_string_lossy().into_owned(),
                };
                return Ok((Self { input, subdir }, fragment));
            }

            let (Some(parent), Some(name)) = (root.parent(), root.file_name()) else {
                break;
            };
            inner = if inner.as_os_str().is_empty() {
                PathBuf::from(name)
            } else {
                Path::new(name).join(&inner)
            };
            root = parent;
        }

        let input = registry.input_from_attrs(path_attrs(&path)?)?;
        Ok((
            Self {
                input,
                subdir: dir.unwrap_or_default(),
            },
            fragment,
        ))
    }

    /// Builds a reference from attributes, `dir` naming the subdirectory.
    pub fn from_attrs(registry: &'r Registry, mut attrs: Attrs) -> Result<Self, Error> {
        let subdir = maybe_get_str(&attrs, "dir")?.unwrap_or_default().to_string();
        attrs.remove("dir");
        Ok(Self {
            input: registry.input_from_attrs(attrs)?,
            subdir,
        })
    }

    pub fn to_attrs(&self) -> Attrs {
        let mut attrs = self.input.to_attrs();
        if !self.subdir.is_empty() {
            attrs.insert("dir".into(), Attr::from(self.subdir.as_str()));
        }
        attrs
    }

    /// Fetches the input, returning the tree and the reference locked to
    /// what was fetched.
    pub async fn fetch_tree(&self, ctx: &FetchContext) -> Result<(Tree, SourceRef<'r>), Error> {
        let (tree, input) = self.input.fetch(ctx).await?;
        Ok((
            tree,
            SourceRef {
                input,
                subdir: self.subdir.clone(),
            },
        ))
    }
}

fn path_attrs(path: &Path) -> Result<Attrs, Error> {
    let path = path
        .to_str()
        .ok_or_else(|| Error::Malformed(format!("path '{}' is not valid UTF-8", path.display())))?;
    Ok(attrs([("type", "path"), ("path", path)]))
}

impl fmt::Display for SourceRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Ok(mut url) = self.input.to_url() else {
            return write!(f, "{}", crate::attrs::attrs_to_json(&self.to_attrs()));
        };
        if !self.subdir.is_empty() {
            url.query_pairs_mut().append_pair("dir", &self.subdir);
        }
        f.write_str(url.as_str())
    }
}
