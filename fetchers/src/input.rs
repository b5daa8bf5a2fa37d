//! Inputs: a bag of attributes describing a source, bound to the scheme
//! that knows how to fetch it.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use ferrix_compat::{
    nixhash::{self, CAHash, HashAlgo, NixHash},
    store_path::{build_ca_path, StorePath},
};
use tracing::{debug, instrument};
use url::Url;

use crate::{
    attrs::{maybe_get_int, maybe_get_str, Attr, Attrs},
    schemes, Error, FetchContext,
};

/// A fetched source tree in the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    /// Where the contents can be read from on the local filesystem, if the
    /// store keeps them locally.
    pub actual_path: Option<PathBuf>,
    pub store_path: StorePath,
}

/// A kind of source (git repositories, tarballs, …).
///
/// Schemes parse and validate attributes, turn them back into URLs, and
/// fetch inputs into a store.
#[async_trait]
pub trait InputScheme: Send + Sync {
    /// The value of the `type` attribute of inputs of this scheme.
    fn scheme_type(&self) -> &'static str;

    /// Attributes (besides `type` and `narHash`) inputs may carry.
    fn allowed_attrs(&self) -> &'static [&'static str];

    /// Parses a URL into attributes, or returns None if the URL isn't
    /// handled by this scheme.
    fn input_from_url(&self, url: &Url) -> Result<Option<Attrs>, Error>;

    /// Validates and normalises attributes before an input is built from
    /// them.
    fn preprocess_attrs(&self, attrs: Attrs) -> Result<Attrs, Error> {
        Ok(attrs)
    }

    fn to_url(&self, input: &Input<'_>) -> Result<Url, Error>;

    /// Whether the input carries everything a fetch would add, so a store
    /// path with its NAR hash can be used without fetching.
    fn has_all_info(&self, input: &Input<'_>) -> bool;

    fn apply_overrides(
        &self,
        _attrs: &mut Attrs,
        git_ref: Option<&str>,
        rev: Option<&str>,
    ) -> Result<(), Error> {
        if let Some(git_ref) = git_ref {
            return Err(Error::Unsupported(format!(
                "setting the branch/tag name to '{git_ref}'"
            )));
        }
        if let Some(rev) = rev {
            return Err(Error::Unsupported(format!("setting the revision to '{rev}'")));
        }
        Ok(())
    }

    async fn clone_to(
        &self,
        _ctx: &FetchContext,
        _input: &Input<'_>,
        _dest: &Path,
    ) -> Result<(), Error> {
        Err(Error::Unsupported("cloning".into()))
    }

    /// The local directory the input refers to, if it's mutable in place.
    fn get_source_path(&self, _input: &Input<'_>) -> Option<PathBuf> {
        None
    }

    async fn put_file(
        &self,
        _input: &Input<'_>,
        _path: &Path,
        _contents: &[u8],
        _commit_msg: Option<&str>,
    ) -> Result<(), Error> {
        Err(Error::Unsupported("writing files".into()))
    }

    /// Fetches the input into the store, returning the path and the input's
    /// attributes completed with what was learned (revision, …).
    async fn fetch(
        &self,
        ctx: &FetchContext,
        input: &Input<'_>,
    ) -> Result<(StorePath, Attrs), Error>;

    /// Whether a `rev` attribute alone pins the contents.
    fn is_locked_by_rev(&self) -> bool {
        true
    }
}

/// Holds the known schemes. Constructed once and passed to whatever parses
/// inputs, inputs borrow their scheme from it.
#[derive(Default)]
pub struct Registry {
    schemes: Vec<Box<dyn InputScheme>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `path`, `git`, `git-locked`, `tarball`, `file`,
    /// `github`, `gitlab` and `sourcehut` schemes.
    pub fn with_builtin_schemes() -> Self {
        let mut registry = Self::new();
        for scheme in schemes::builtin() {
            registry.register(scheme);
        }
        registry
    }

    /// Adds a scheme. URLs are offered to schemes in registration order.
    pub fn register(&mut self, scheme: Box<dyn InputScheme>) {
        self.schemes.push(scheme);
    }

    pub fn scheme(&self, scheme_type: &str) -> Option<&dyn InputScheme> {
        self.schemes
            .iter()
            .find(|s| s.scheme_type() == scheme_type)
            .map(|s| s.as_ref())
    }

    pub fn input_from_url(&self, url: &str) -> Result<Input<'_>, Error> {
        let parsed = Url::parse(url).map_err(|e| Error::bad_url(url, e))?;
        for scheme in &self.schemes {
            if let Some(attrs) = scheme.input_from_url(&parsed)? {
                return Input::new(scheme.as_ref(), attrs);
            }
        }
        Err(Error::UnsupportedInput(format!("input '{url}' is unsupported")))
    }

    pub fn input_from_attrs(&self, attrs: Attrs) -> Result<Input<'_>, Error> {
        let scheme_type = maybe_get_str(&attrs, "type")?
            .ok_or_else(|| Error::MissingAttribute("type".into()))?;
        let scheme = self.scheme(scheme_type).ok_or_else(|| {
            Error::UnsupportedInput(format!("input type '{scheme_type}' is unsupported"))
        })?;
        Input::new(scheme, attrs)
    }
}

/// A source, described by attributes, bound to the scheme of its `type`.
#[derive(Clone)]
pub struct Input<'r> {
    scheme: &'r dyn InputScheme,
    attrs: Attrs,
    locked: bool,
    direct: bool,
    /// Directory relative `path` inputs are resolved against.
    parent: Option<PathBuf>,
}

impl<'r> Input<'r> {
    pub(crate) fn new(scheme: &'r dyn InputScheme, attrs: Attrs) -> Result<Self, Error> {
        let mut attrs = scheme.preprocess_attrs(attrs)?;
        for name in attrs.keys() {
            if name != "type" && name != "narHash" && !scheme.allowed_attrs().contains(&name.as_str())
            {
                return Err(Error::UnsupportedAttribute {
                    scheme: scheme.scheme_type().into(),
                    attr: name.clone(),
                });
            }
        }
        attrs.insert("type".into(), Attr::from(scheme.scheme_type()));

        let mut input = Self {
            scheme,
            attrs,
            locked: false,
            direct: true,
            parent: None,
        };
        input.fixup()?;
        Ok(input)
    }

    /// Checks the well-known attributes have the right types and derives
    /// whether the input is locked.
    fn fixup(&mut self) -> Result<(), Error> {
        self.get_ref()?;
        self.get_rev_count()?;
        self.get_last_modified()?;
        if self.get_rev()?.is_some() && self.scheme.is_locked_by_rev() {
            self.locked = true;
        }
        if self.get_nar_hash()?.is_some() {
            self.locked = true;
        }
        Ok(())
    }

    fn with_attrs(&self, attrs: Attrs) -> Result<Self, Error> {
        let mut input = Self::new(self.scheme, attrs)?;
        input.direct = self.direct;
        input.parent = self.parent.clone();
        Ok(input)
    }

    pub fn scheme(&self) -> &'r dyn InputScheme {
        self.scheme
    }

    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    pub fn to_attrs(&self) -> Attrs {
        self.attrs.clone()
    }

    pub fn to_url(&self) -> Result<Url, Error> {
        self.scheme.to_url(self)
    }

    pub fn to_url_string(&self) -> Result<String, Error> {
        Ok(self.to_url()?.to_string())
    }

    /// Whether the contents are pinned (by a revision or a NAR hash).
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Whether the input was given directly rather than resolved through
    /// an indirection.
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    pub fn set_direct(&mut self, direct: bool) {
        self.direct = direct;
    }

    pub fn parent(&self) -> Option<&Path> {
        self.parent.as_deref()
    }

    pub fn set_parent(&mut self, parent: Option<PathBuf>) {
        self.parent = parent;
    }

    pub fn has_all_info(&self) -> bool {
        matches!(self.get_nar_hash(), Ok(Some(_))) && self.scheme.has_all_info(self)
    }

    /// Whether `other` refers to the same source, possibly at another
    /// revision or branch.
    pub fn contains(&self, other: &Input<'_>) -> bool {
        if self == other {
            return true;
        }
        let mut other_attrs = other.attrs.clone();
        other_attrs.remove("ref");
        other_attrs.remove("rev");
        self.attrs == other_attrs
    }

    pub fn get_type(&self) -> &'static str {
        self.scheme.scheme_type()
    }

    pub fn get_name(&self) -> String {
        maybe_get_str(&self.attrs, "name")
            .ok()
            .flatten()
            .unwrap_or("source")
            .to_string()
    }

    pub fn get_ref(&self) -> Result<Option<String>, Error> {
        Ok(maybe_get_str(&self.attrs, "ref")?.map(str::to_string))
    }

    /// The git revision, a sha1 (40 hex digits) or sha256 (64) hash.
    pub fn get_rev(&self) -> Result<Option<NixHash>, Error> {
        maybe_get_str(&self.attrs, "rev")?
            .map(parse_rev)
            .transpose()
    }

    pub fn get_rev_count(&self) -> Result<Option<u64>, Error> {
        maybe_get_int(&self.attrs, "revCount")
    }

    pub fn get_last_modified(&self) -> Result<Option<u64>, Error> {
        maybe_get_int(&self.attrs, "lastModified")
    }

    pub fn get_nar_hash(&self) -> Result<Option<NixHash>, Error> {
        maybe_get_str(&self.attrs, "narHash")?
            .map(|s| nixhash::parse_any(s, Some(HashAlgo::Sha256)).map_err(Error::from))
            .transpose()
    }

    /// The store path the input's contents have, computed from `narHash`.
    pub fn compute_store_path(&self) -> Result<StorePath, Error> {
        let nar_hash = self.get_nar_hash()?.ok_or_else(|| {
            Error::Malformed(format!(
                "cannot compute the store path of unlocked input '{self}'"
            ))
        })?;
        build_ca_path(
            self.get_name(),
            &CAHash::Nar(nar_hash),
            Vec::<String>::new(),
            false,
        )
        .map_err(|e| Error::Malformed(e.to_string()))
    }

    /// Fetches the input into the store, returning the tree and the
    /// input locked to what was fetched.
    ///
    /// Inputs with all their info whose store path is already valid are
    /// not fetched again.
    #[instrument(skip_all, fields(input = %self), err)]
    pub async fn fetch(&self, ctx: &FetchContext) -> Result<(Tree, Input<'r>), Error> {
        let tree = |store_path: StorePath| Tree {
            actual_path: ctx.store.real_path(&store_path),
            store_path,
        };

        if self.has_all_info() {
            let store_path = self.compute_store_path()?;
            if ctx.store.is_valid_path(&store_path).await? {
                debug!(store_path = %store_path, "input already in store");
                return Ok((tree(store_path), self.clone()));
            }
        }

        let (store_path, attrs) = self.scheme.fetch(ctx, self).await?;
        let mut input = self.with_attrs(attrs)?;

        let info = ctx
            .store
            .query_path_info(&store_path)
            .await?
            .ok_or_else(|| Error::Fatal(format!("fetched path '{store_path}' is not valid")))?;
        let nar_hash = NixHash::Sha256(info.nar_sha256);

        if let Some(expected) = self.get_nar_hash()? {
            if expected != nar_hash {
                return Err(Error::Integrity(format!(
                    "NAR hash mismatch in input '{self}' ({store_path}), expected '{}', got '{}'",
                    expected.to_sri_string(),
                    nar_hash.to_sri_string()
                )));
            }
        }
        input
            .attrs
            .insert("narHash".into(), Attr::from(nar_hash.to_sri_string()));

        if let Some(expected) = self.get_last_modified()? {
            let got = input.get_last_modified()?;
            if got != Some(expected) {
                return Err(Error::Integrity(format!(
                    "'lastModified' attribute mismatch in input '{self}', expected {expected}, got {}",
                    got.map(|v| v.to_string()).unwrap_or_else(|| "nothing".into())
                )));
            }
        }

        if let Some(expected) = self.get_rev_count()? {
            let got = input.get_rev_count()?;
            if got != Some(expected) {
                return Err(Error::Integrity(format!(
                    "'revCount' attribute mismatch in input '{self}', expected {expected}, got {}",
                    got.map(|v| v.to_string()).unwrap_or_else(|| "nothing".into())
                )));
            }
        }

        input.locked = true;
        debug!(store_path = %store_path, locked = %input, "fetched input");
        Ok((tree(store_path), input))
    }

    /// Returns the input pointing at another branch/tag or revision.
    pub fn apply_overrides(&self, git_ref: Option<&str>, rev: Option<&str>) -> Result<Self, Error> {
        if git_ref.is_none() && rev.is_none() {
            return Ok(self.clone());
        }
        if let Some(rev) = rev {
            parse_rev(rev)?;
        }
        let mut attrs = self.attrs.clone();
        self.scheme.apply_overrides(&mut attrs, git_ref, rev)?;
        self.with_attrs(attrs)
    }

    /// Clones the input's source into `dest`, in a form that can be worked
    /// on (a git checkout for repositories).
    pub async fn clone_to(&self, ctx: &FetchContext, dest: &Path) -> Result<(), Error> {
        self.scheme.clone_to(ctx, self, dest).await
    }

    pub fn get_source_path(&self) -> Option<PathBuf> {
        self.scheme.get_source_path(self)
    }

    /// Writes `contents` to `path` (relative to the source path), and
    /// commits it with `commit_msg` where the scheme supports that.
    pub async fn put_file(
        &self,
        path: &Path,
        contents: &[u8],
        commit_msg: Option<&str>,
    ) -> Result<(), Error> {
        if path.is_absolute() || path.components().any(|c| c == std::path::Component::ParentDir)
        {
            return Err(Error::Malformed(format!(
                "'{}' is not a path inside the input",
                path.display()
            )));
        }
        self.scheme.put_file(self, path, contents, commit_msg).await
    }
}

/// Parses a git revision, sha1 or sha256 in hex.
pub(crate) fn parse_rev(rev: &str) -> Result<NixHash, Error> {
    let algo = match rev.len() {
        40 => HashAlgo::Sha1,
        64 => HashAlgo::Sha256,
        _ => {
            return Err(Error::Malformed(format!(
                "'{rev}' is not a valid git revision"
            )))
        }
    };
    Ok(nixhash::parse_non_sri_unprefixed(rev, algo)?)
}

impl PartialEq for Input<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.attrs == other.attrs
    }
}

impl fmt::Display for Input<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_url_string() {
            Ok(url) => f.write_str(&url),
            Err(_) => write!(f, "{}", crate::attrs::attrs_to_json(&self.attrs)),
        }
    }
}

impl fmt::Debug for Input<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Input")
            .field("type", &self.scheme.scheme_type())
            .field("attrs", &self.attrs)
            .field("locked", &self.locked)
            .field("direct", &self.direct)
            .field("parent", &self.parent)
            .finish()
    }
}
