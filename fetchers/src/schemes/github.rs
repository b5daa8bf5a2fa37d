//! Repositories on code hosting services (GitHub, GitLab, SourceHut),
//! fetched as tarballs of a single commit.
//!
//! Fetching is two steps: a branch or tag is resolved to a commit through
//! the service's API, then the tarball of that commit is downloaded.

use std::path::Path;

use async_trait::async_trait;
use ferrix_compat::{nixhash::NixHash, store_path::StorePath};
use percent_encoding::percent_decode_str;
use regex::Regex;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{parse_int_param, query_map, GitInputScheme};
use crate::{
    attrs::{get_str, maybe_get_str, Attr, Attrs},
    download::{download_file, download_tarball},
    git_utils::{parse_ls_remote_line, HOST_REGEX, REF_REGEX, REV_REGEX},
    input::parse_rev,
    Error, FetchContext, Input, InputScheme,
};

const ALLOWED_ATTRS: &[&str] = &["host", "lastModified", "owner", "ref", "repo", "rev"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    GitHub,
    GitLab,
    SourceHut,
}

impl Provider {
    fn scheme_type(self) -> &'static str {
        match self {
            Provider::GitHub => "github",
            Provider::GitLab => "gitlab",
            Provider::SourceHut => "sourcehut",
        }
    }

    fn default_host(self) -> &'static str {
        match self {
            Provider::GitHub => "github.com",
            Provider::GitLab => "gitlab.com",
            Provider::SourceHut => "git.sr.ht",
        }
    }

    /// Turns a configured access token into a request header.
    fn access_header(self, token: &str) -> Option<(String, String)> {
        match self {
            Provider::GitHub => Some(("Authorization".into(), format!("token {token}"))),
            // `<type>:<value>`, unknown types are sent as a raw header.
            Provider::GitLab => match token.split_once(':') {
                Some(("OAuth2", value)) => {
                    Some(("Authorization".into(), format!("Bearer {value}")))
                }
                Some(("PAT", value)) => Some(("Private-token".into(), value.into())),
                Some((kind, value)) => {
                    warn!(kind, "unrecognized GitLab token type");
                    Some((kind.into(), value.into()))
                }
                None => None,
            },
            Provider::SourceHut => Some(("Authorization".into(), format!("Bearer {token}"))),
        }
    }
}

/// owner/repo on a host, as named by an input.
struct Repo<'a> {
    host: &'a str,
    owner: &'a str,
    repo: &'a str,
}

pub struct ArchiveInputScheme {
    provider: Provider,
    /// URL scheme the service is reached over.
    transport: &'static str,
}

impl ArchiveInputScheme {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            transport: "https",
        }
    }

    /// Talks plain HTTP to the service.
    #[cfg(test)]
    pub(crate) fn over_http(provider: Provider) -> Self {
        Self {
            provider,
            transport: "http",
        }
    }

    fn repo<'a>(&self, attrs: &'a Attrs) -> Result<Repo<'a>, Error> {
        Ok(Repo {
            host: maybe_get_str(attrs, "host")?.unwrap_or(self.provider.default_host()),
            owner: get_str(attrs, "owner")?,
            repo: get_str(attrs, "repo")?,
        })
    }

    fn access_token<'c>(&self, ctx: &'c FetchContext, host: &str) -> Option<&'c str> {
        ctx.settings.access_token(host)
    }

    fn auth_headers(&self, ctx: &FetchContext, host: &str) -> Vec<(String, String)> {
        let mut headers = vec![];
        if let Some(token) = self.access_token(ctx, host) {
            match self.provider.access_header(token) {
                Some(header) => headers.push(header),
                None => warn!(host, "unrecognized access token"),
            }
        }
        if self.provider == Provider::GitHub {
            headers.push(("X-GitHub-Api-Version".into(), "2022-11-28".into()));
        }
        headers
    }

    /// Downloads a small API response and returns its contents.
    async fn read_api(
        &self,
        ctx: &FetchContext,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Vec<u8>, Error> {
        let file = download_file(ctx, url, "source", false, headers).await?;
        let path = ctx.store.real_path(&file.store_path).ok_or_else(|| {
            Error::Fatal(format!("store '{}' has no local files", ctx.store.uri()))
        })?;
        Ok(tokio::fs::read(path).await?)
    }

    /// Resolves a branch or tag (or `HEAD`) to a commit through the
    /// service's API.
    #[instrument(skip(self, ctx, repo), fields(owner = repo.owner, repo = repo.repo), err)]
    async fn rev_from_ref(
        &self,
        ctx: &FetchContext,
        repo: &Repo<'_>,
        git_ref: &str,
    ) -> Result<NixHash, Error> {
        let Repo { host, owner, repo } = repo;
        let transport = self.transport;
        let headers = self.auth_headers(ctx, host);

        let rev = match self.provider {
            Provider::GitHub => {
                let url = if *host == "github.com" {
                    format!("{transport}://api.{host}/repos/{owner}/{repo}/commits/{git_ref}")
                } else {
                    format!("{transport}://{host}/api/v3/repos/{owner}/{repo}/commits/{git_ref}")
                };
                let json: serde_json::Value =
                    serde_json::from_slice(&self.read_api(ctx, &url, &headers).await?)?;
                let sha = json["sha"].as_str().ok_or_else(|| {
                    Error::Malformed(format!("GitHub API response for '{url}' has no 'sha'"))
                })?;
                parse_rev(sha)?
            }
            Provider::GitLab => {
                let url = format!(
                    "{transport}://{host}/api/v4/projects/{owner}%2F{repo}/repository/commits?ref_name={git_ref}"
                );
                let json: serde_json::Value =
                    serde_json::from_slice(&self.read_api(ctx, &url, &headers).await?)?;
                match json.as_array().map(|a| a.as_slice()) {
                    Some([]) => {
                        return Err(Error::NotFound(
                            "no commits returned by the GitLab API, does the ref really exist?"
                                .into(),
                        ))
                    }
                    Some([first, ..]) if first["id"].is_string() => {
                        parse_rev(first["id"].as_str().unwrap_or_default())?
                    }
                    _ => {
                        return Err(Error::Malformed(format!(
                            "unexpected response from GitLab: {json}"
                        )))
                    }
                }
            }
            Provider::SourceHut => {
                let base_url = format!("{transport}://{host}/{owner}/{repo}");

                let ref_uri = if git_ref == "HEAD" {
                    let head = self
                        .read_api(ctx, &format!("{base_url}/HEAD"), &headers)
                        .await?;
                    let head = String::from_utf8_lossy(&head);
                    let line = head.lines().next().unwrap_or_default();
                    let target = parse_ls_remote_line(line)
                        .ok_or_else(|| {
                            Error::Malformed(format!(
                                "in '{base_url}', couldn't resolve HEAD ref '{line}'"
                            ))
                        })?
                        .target;
                    regex::escape(&target)
                } else {
                    format!("refs/(heads|tags)/{}", regex::escape(git_ref))
                };
                let ref_regex = Regex::new(&format!("^{ref_uri}$"))
                    .map_err(|e| Error::Malformed(e.to_string()))?;

                let refs = self
                    .read_api(ctx, &format!("{base_url}/info/refs"), &headers)
                    .await?;
                let refs = String::from_utf8_lossy(&refs);
                let id = refs
                    .lines()
                    .filter_map(parse_ls_remote_line)
                    .find(|line| {
                        line.reference
                            .as_deref()
                            .map_or(false, |r| ref_regex.is_match(r))
                    })
                    .map(|line| line.target)
                    .ok_or_else(|| {
                        Error::NotFound(format!("in '{base_url}', couldn't find ref '{git_ref}'"))
                    })?;
                parse_rev(&id)?
            }
        };

        debug!(git_ref, rev = %rev.to_plain_hex_string(), "resolved revision");
        Ok(rev)
    }

    /// The URL of the tarball of `rev`, and the headers to fetch it with.
    fn download_url(
        &self,
        ctx: &FetchContext,
        repo: &Repo<'_>,
        rev: &str,
    ) -> (String, Vec<(String, String)>) {
        let Repo { host, owner, repo } = repo;
        let transport = self.transport;
        let headers = self.auth_headers(ctx, host);

        let url = match self.provider {
            // The public archive URLs have laxer rate limits than the API.
            Provider::GitHub if *host != "github.com" => {
                format!("{transport}://{host}/api/v3/repos/{owner}/{repo}/tarball/{rev}")
            }
            Provider::GitHub if self.access_token(ctx, host).is_none() => {
                format!("{transport}://{host}/{owner}/{repo}/archive/{rev}.tar.gz")
            }
            Provider::GitHub => {
                format!("{transport}://api.{host}/repos/{owner}/{repo}/tarball/{rev}")
            }
            Provider::GitLab => format!(
                "{transport}://{host}/api/v4/projects/{owner}%2F{repo}/repository/archive.tar.gz?sha={rev}"
            ),
            Provider::SourceHut => {
                format!("{transport}://{host}/{owner}/{repo}/archive/{rev}.tar.gz")
            }
        };
        (url, headers)
    }
}

#[async_trait]
impl InputScheme for ArchiveInputScheme {
    fn scheme_type(&self) -> &'static str {
        self.provider.scheme_type()
    }

    fn allowed_attrs(&self) -> &'static [&'static str] {
        ALLOWED_ATTRS
    }

    fn input_from_url(&self, url: &Url) -> Result<Option<Attrs>, Error> {
        if url.scheme() != self.scheme_type() {
            return Ok(None);
        }

        let path = url
            .path()
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| percent_decode_str(s).decode_utf8().map(|s| s.into_owned()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::bad_url(url, e))?;

        let mut ref_or_rev = match path.len() {
            0 | 1 => return Err(Error::bad_url(url, "expected 'owner/repo'")),
            2 => None,
            3 => Some(path[2].clone()),
            _ => {
                let joined = path[2..].join("/");
                if !REF_REGEX.is_match(&joined) {
                    return Err(Error::bad_url(
                        url,
                        format!("'{joined}' is not a branch/tag name"),
                    ));
                }
                Some(joined)
            }
        };

        let mut attrs = Attrs::new();
        attrs.insert("type".into(), Attr::from(self.scheme_type()));
        attrs.insert("owner".into(), Attr::from(path[0].as_str()));
        attrs.insert("repo".into(), Attr::from(path[1].as_str()));

        for (name, value) in query_map(url) {
            match name.as_str() {
                "rev" | "ref" => {
                    if ref_or_rev.is_some() {
                        return Err(Error::bad_url(url, "URL already contains a ref or rev"));
                    }
                    ref_or_rev = Some(value);
                }
                "lastModified" => {
                    attrs.insert(name.clone(), Attr::from(parse_int_param(url, &name, &value)?));
                }
                _ => {
                    attrs.insert(name, Attr::from(value));
                }
            }
        }

        if let Some(ref_or_rev) = ref_or_rev {
            attrs.insert("refOrRev".into(), Attr::from(ref_or_rev));
        }
        Ok(Some(attrs))
    }

    fn preprocess_attrs(&self, mut attrs: Attrs) -> Result<Attrs, Error> {
        let owner = get_str(&attrs, "owner")?;
        let repo = get_str(&attrs, "repo")?;
        let url = format!("{}:{owner}/{repo}", self.scheme_type());

        if let Some(host) = maybe_get_str(&attrs, "host")? {
            if !HOST_REGEX.is_match(host) {
                return Err(Error::bad_url(url, "invalid instance host"));
            }
        }

        if let Some(Attr::String(ref_or_rev)) = attrs.remove("refOrRev") {
            if REV_REGEX.is_match(&ref_or_rev) {
                attrs.insert("rev".into(), Attr::from(ref_or_rev));
            } else if REF_REGEX.is_match(&ref_or_rev) {
                attrs.insert("ref".into(), Attr::from(ref_or_rev));
            } else {
                return Err(Error::bad_url(
                    url,
                    format!("'{ref_or_rev}' is not a commit hash or a branch/tag name"),
                ));
            }
        } else if let Some(git_ref) = maybe_get_str(&attrs, "ref")? {
            if !REF_REGEX.is_match(git_ref) {
                return Err(Error::bad_url(url, "invalid branch/tag name"));
            }
        }
        Ok(attrs)
    }

    fn to_url(&self, input: &Input<'_>) -> Result<Url, Error> {
        let attrs = input.attrs();
        let mut path = format!(
            "{}:{}/{}",
            self.scheme_type(),
            get_str(attrs, "owner")?,
            get_str(attrs, "repo")?
        );
        if let Some(rev) = input.get_rev()? {
            path = format!("{path}/{}", rev.to_plain_hex_string());
        } else if let Some(git_ref) = input.get_ref()? {
            path = format!("{path}/{git_ref}");
        }

        let mut url = Url::parse(&path).map_err(|e| Error::bad_url(&path, e))?;
        if let Some(host) = maybe_get_str(attrs, "host")? {
            url.query_pairs_mut().append_pair("host", host);
        }
        Ok(url)
    }

    fn has_all_info(&self, input: &Input<'_>) -> bool {
        matches!(input.get_rev(), Ok(Some(_))) && matches!(input.get_last_modified(), Ok(Some(_)))
    }

    fn apply_overrides(
        &self,
        attrs: &mut Attrs,
        git_ref: Option<&str>,
        rev: Option<&str>,
    ) -> Result<(), Error> {
        match (git_ref, rev) {
            (Some(git_ref), Some(rev)) => {
                return Err(Error::Contradictory(format!(
                    "cannot apply both a commit hash ({rev}) and a branch/tag name ('{git_ref}')"
                )))
            }
            (None, Some(rev)) => {
                attrs.insert("rev".into(), Attr::from(rev));
                attrs.remove("ref");
            }
            (Some(git_ref), None) => {
                attrs.insert("ref".into(), Attr::from(git_ref));
                attrs.remove("rev");
            }
            (None, None) => {}
        }
        Ok(())
    }

    async fn clone_to(
        &self,
        ctx: &FetchContext,
        input: &Input<'_>,
        dest: &Path,
    ) -> Result<(), Error> {
        let Repo { host, owner, repo } = self.repo(input.attrs())?;
        let suffix = if self.provider == Provider::SourceHut {
            ""
        } else {
            ".git"
        };
        let url = format!("git+{}://{host}/{owner}/{repo}{suffix}", self.transport);

        let git = GitInputScheme::new();
        let parsed = Url::parse(&url).map_err(|e| Error::bad_url(&url, e))?;
        let attrs = git
            .input_from_url(&parsed)?
            .ok_or_else(|| Error::bad_url(&url, "not a git URL"))?;
        let rev = input.get_rev()?.map(|r| r.to_plain_hex_string());
        Input::new(&git, attrs)?
            .apply_overrides(input.get_ref()?.as_deref(), rev.as_deref())?
            .clone_to(ctx, dest)
            .await
    }

    #[instrument(skip_all, fields(input = %input), err)]
    async fn fetch(
        &self,
        ctx: &FetchContext,
        input: &Input<'_>,
    ) -> Result<(StorePath, Attrs), Error> {
        let mut attrs = input.to_attrs();
        let repo = self.repo(input.attrs())?;

        let rev = match input.get_rev()? {
            Some(rev) => rev,
            None => {
                let git_ref = input.get_ref()?.unwrap_or_else(|| "HEAD".into());
                self.rev_from_ref(ctx, &repo, &git_ref).await?
            }
        };
        let rev = rev.to_plain_hex_string();

        attrs.remove("ref");
        attrs.insert("rev".into(), Attr::from(rev.as_str()));

        let (url, headers) = self.download_url(ctx, &repo, &rev);
        let result = download_tarball(ctx, &url, &input.get_name(), true, &headers).await?;

        attrs.insert("lastModified".into(), Attr::from(result.last_modified));
        Ok((result.tree.store_path, attrs))
    }
}
