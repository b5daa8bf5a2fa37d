//! The built-in input schemes.

use std::collections::BTreeMap;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::{
    attrs::{Attr, Attrs},
    Error, InputScheme,
};

mod git;
mod github;
mod path;
mod tarball;

pub use git::GitInputScheme;
pub use github::{ArchiveInputScheme, Provider};
pub(crate) use path::absolute;
pub use path::PathInputScheme;
pub use tarball::{CurlInputScheme, CurlKind};

/// All built-in schemes, in the order URLs are offered to them.
pub(crate) fn builtin() -> Vec<Box<dyn InputScheme>> {
    vec![
        Box::new(PathInputScheme),
        Box::new(GitInputScheme::new()),
        Box::new(GitInputScheme::locked()),
        Box::new(CurlInputScheme::new(CurlKind::Tarball)),
        Box::new(CurlInputScheme::new(CurlKind::File)),
        Box::new(ArchiveInputScheme::new(Provider::GitHub)),
        Box::new(ArchiveInputScheme::new(Provider::GitLab)),
        Box::new(ArchiveInputScheme::new(Provider::SourceHut)),
    ]
}

/// The query parameters of `url`. Later duplicates win.
pub(crate) fn query_map(url: &Url) -> BTreeMap<String, String> {
    url.query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// The percent-decoded path of `url`.
pub(crate) fn decoded_path(url: &Url) -> Result<String, Error> {
    percent_decode_str(url.path())
        .decode_utf8()
        .map(|p| p.into_owned())
        .map_err(|e| Error::bad_url(url, e))
}

pub(crate) fn parse_int_param(url: &Url, name: &str, value: &str) -> Result<u64, Error> {
    value
        .parse()
        .map_err(|_| Error::bad_url(url, format!("'{name}' must be an integer, got '{value}'")))
}

/// Sets the query of `url` to the given attributes, or clears it if there
/// are none.
pub(crate) fn set_query<'a>(url: &mut Url, query: impl IntoIterator<Item = (&'a str, &'a Attr)>) {
    url.set_query(None);
    let mut query = query.into_iter().peekable();
    if query.peek().is_none() {
        return;
    }
    let mut pairs = url.query_pairs_mut();
    for (name, value) in query {
        pairs.append_pair(name, &value.to_query_value());
    }
}

/// Attributes, except the given ones.
pub(crate) fn attrs_without<'a>(
    attrs: &'a Attrs,
    skip: &'a [&'a str],
) -> impl Iterator<Item = (&'a str, &'a Attr)> + 'a {
    attrs
        .iter()
        .filter(move |(k, _)| !skip.contains(&k.as_str()))
        .map(|(k, v)| (k.as_str(), v))
}
