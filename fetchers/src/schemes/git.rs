use std::{
    collections::BTreeSet,
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use ferrix_compat::{nixbase32, store_path::StorePath};
use ferrix_store::nar::PathFilter;
use filetime::FileTime;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{decoded_path, parse_int_param, query_map, set_query};
use crate::{
    attrs::{self, get_int, get_str, maybe_get_bool, Attr, Attrs},
    git_utils::{is_bad_git_ref, parse_ls_remote_line, RefKind, REV_REGEX},
    input::parse_rev,
    lock::PathLock,
    run::{wait_checked, Program},
    Error, FetchContext, Input, InputScheme, Outcome,
};

/// Initial branch of the bare mirrors. Never fetched, HEAD is always
/// repointed at a real branch.
const GIT_INITIAL_BRANCH: &str = "__nix_dummy_branch";

const ALLOWED_ATTRS: &[&str] = &[
    "allRefs",
    "dirtyRev",
    "dirtyShortRev",
    "lastModified",
    "name",
    "ref",
    "rev",
    "revCount",
    "shallow",
    "submodules",
    "url",
];

/// Git repositories, local (working trees, possibly dirty) or remote
/// (fetched into a bare mirror in the cache directory).
pub struct GitInputScheme {
    locked: bool,
}

impl GitInputScheme {
    pub fn new() -> Self {
        Self { locked: false }
    }

    /// The `git-locked` variant: inputs known to carry all their info. Only
    /// reachable through attributes.
    pub fn locked() -> Self {
        Self { locked: true }
    }
}

impl Default for GitInputScheme {
    fn default() -> Self {
        Self::new()
    }
}

/// `git -C dir --git-dir git_dir`
fn git(dir: &Path, git_dir: &str) -> Program {
    Program::new("git")
        .arg("-C")
        .arg(dir)
        .args(["--git-dir", git_dir])
}

fn flag(input: &Input<'_>, name: &str) -> Result<bool, Error> {
    Ok(maybe_get_bool(input.attrs(), name)?.unwrap_or(false))
}

fn parse_number(output: &str, what: &str) -> Result<u64, Error> {
    output
        .trim()
        .parse()
        .map_err(|_| Error::Fatal(format!("git returned an invalid {what}: '{}'", output.trim())))
}

fn failed(description: &str, output: &std::process::Output) -> Error {
    Error::Command {
        command: description.to_string(),
        status: output.status.to_string(),
        stderr: format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
        .trim()
        .to_string(),
    }
}

/// Where the mirror of the repository at `url` lives.
fn cache_path(cache_dir: &Path, url: &str) -> PathBuf {
    cache_dir
        .join("gitv3")
        .join(nixbase32::encode(&Sha256::digest(url.as_bytes())))
}

fn lock_path(cache_dir: &Path) -> PathBuf {
    let mut path = OsString::from(cache_dir);
    path.push(".lock");
    path.into()
}

fn within_ttl(path: &Path, now: SystemTime, ttl: u64) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|mtime| {
            mtime
                .checked_add(Duration::from_secs(ttl))
                .map_or(true, |fresh_until| fresh_until > now)
        })
        .unwrap_or(false)
}

fn is_initial_branch(head: &str) -> bool {
    head == GIT_INITIAL_BRANCH || head.strip_prefix("refs/heads/") == Some(GIT_INITIAL_BRANCH)
}

/// The branch (or revision) HEAD of the repository at `location` points at.
async fn read_head(location: impl AsRef<OsStr>) -> Option<String> {
    let location = location.as_ref();
    let output = Program::new("git")
        .args(["ls-remote", "--symref"])
        .arg(location)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = parse_ls_remote_line(stdout.lines().next()?)?;
    match line.kind {
        RefKind::Symbolic => debug!(head = %line.target, ?location, "resolved HEAD ref"),
        RefKind::Object => debug!(head = %line.target, ?location, "resolved HEAD rev"),
    }
    Some(line.target)
}

/// Like [read_head], but asks the mirror of the repository first, as long
/// as its HEAD was updated within the TTL.
async fn read_head_cached(ctx: &FetchContext, url: &str) -> Option<String> {
    let cache_dir = cache_path(&ctx.settings.cache_dir, url);
    let head_file = cache_dir.join("HEAD");

    let mut cached = None;
    if head_file.exists() {
        cached = read_head(&cache_dir).await;
        if let Some(head) = &cached {
            if !is_initial_branch(head)
                && within_ttl(&head_file, SystemTime::now(), ctx.settings.tarball_ttl)
            {
                debug!(head, url, "using cached HEAD ref");
                return cached;
            }
        }
    }

    if let Some(head) = read_head(url).await {
        return Some(head);
    }
    if let Some(head) = &cached {
        warn!(head, url, "could not get HEAD ref for repository, using expired cached ref");
    }
    cached
}

/// Points HEAD of the mirror at `head`. Returns false if git refused.
async fn store_cached_head(cache_dir: &Path, head: &str) -> Result<bool, Error> {
    match git(cache_dir, ".")
        .args(["symbolic-ref", "--", "HEAD", head])
        .outcome()
        .await
    {
        Outcome::Success(_) => Ok(true),
        Outcome::NotFound(_) => Ok(false),
        Outcome::Transient(msg) | Outcome::Fatal(msg) => Err(Error::Fatal(msg)),
    }
}

/// The ref file in the mirror `git_ref` resolves to, among those matching
/// `condition`.
fn resolve_ref_file(
    cache_dir: &Path,
    git_ref: &str,
    condition: impl Fn(&Path) -> bool,
) -> Option<PathBuf> {
    if git_ref.starts_with("refs/") {
        let full = cache_dir.join(git_ref);
        if condition(&full) {
            return Some(full);
        }
    }
    ["", "tags/", "heads/"]
        .iter()
        .map(|infix| cache_dir.join(format!("refs/{infix}{git_ref}")))
        .find(|candidate| condition(candidate.as_path()))
}

struct WorkdirInfo {
    clean: bool,
    has_head: bool,
}

/// Whether the working tree at `workdir` is clean and has commits.
async fn workdir_info(workdir: &Path, submodules: bool) -> Result<WorkdirInfo, Error> {
    // the messages below are matched on
    let program = git(workdir, ".git")
        .env("LC_ALL", "C")
        .args(["rev-parse", "--verify", "--no-revs", "HEAD^{commit}"]);
    let description = program.description().to_string();
    let output = program.output().await?;
    let message = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    if message.contains("fatal: not a git repository") {
        return Err(Error::Malformed(format!(
            "'{}' is not a Git repository",
            workdir.display()
        )));
    }
    let has_head = output.status.success();
    // "Needed a single revision" means there are no commits yet
    if !has_head && !message.contains("fatal: Needed a single revision") {
        return Err(failed(&description, &output));
    }

    let mut clean = false;
    if has_head {
        let program = git(workdir, ".git")
            .args(["diff", "HEAD", "--quiet"])
            .args((!submodules).then_some("--ignore-submodules"))
            .arg("--");
        let description = program.description().to_string();
        let output = program.output().await?;
        clean = match output.status.code() {
            Some(0) => true,
            Some(1) => false,
            _ => return Err(failed(&description, &output)),
        };
    }

    Ok(WorkdirInfo { clean, has_head })
}

/// Copies the files git tracks in a dirty working tree into the store.
#[instrument(skip_all, fields(workdir = %workdir.display()), err)]
async fn fetch_from_workdir(
    ctx: &FetchContext,
    input: &Input<'_>,
    workdir: &Path,
    info: WorkdirInfo,
    submodules: bool,
) -> Result<(StorePath, Attrs), Error> {
    if !ctx.settings.allow_dirty {
        return Err(Error::Integrity(format!(
            "Git tree '{}' is dirty",
            workdir.display()
        )));
    }
    if ctx.settings.warn_dirty {
        warn!(workdir = %workdir.display(), "Git tree is dirty");
    }

    let files: BTreeSet<String> = git(workdir, ".git")
        .args(["ls-files", "-z"])
        .args(submodules.then_some("--recurse-submodules"))
        .run()
        .await?
        .split('\0')
        .filter(|file| !file.is_empty())
        .map(str::to_string)
        .collect();

    let root = workdir.to_path_buf();
    let filter: Arc<PathFilter> = Arc::new(move |path: &Path| {
        let Ok(rel) = path.strip_prefix(&root) else {
            return false;
        };
        let rel = rel.to_string_lossy();
        if path.symlink_metadata().is_ok_and(|m| m.is_dir()) {
            let prefix = format!("{rel}/");
            files
                .range(prefix.clone()..)
                .next()
                .is_some_and(|file| file.starts_with(&prefix))
                || files.contains(rel.as_ref())
        } else {
            files.contains(rel.as_ref())
        }
    });

    let store_path = ctx
        .store
        .add_to_store_recursive(&input.get_name(), workdir, Some(filter))
        .await?;

    let mut attrs = input.to_attrs();
    let last_modified = if info.has_head {
        let out = git(workdir, ".git")
            .args(["log", "-1", "--format=%ct", "--no-show-signature", "HEAD"])
            .run()
            .await?;
        parse_number(&out, "commit time")?
    } else {
        0
    };
    attrs.insert("lastModified".into(), Attr::from(last_modified));

    if info.has_head {
        let rev = git(workdir, ".git")
            .args(["rev-parse", "--verify", "HEAD"])
            .run()
            .await?;
        let short_rev = git(workdir, ".git")
            .args(["rev-parse", "--verify", "--short", "HEAD"])
            .run()
            .await?;
        attrs.insert(
            "dirtyRev".into(),
            Attr::from(format!("{}-dirty", rev.trim())),
        );
        attrs.insert(
            "dirtyShortRev".into(),
            Attr::from(format!("{}-dirty", short_rev.trim())),
        );
    }

    Ok((store_path, attrs))
}

/// Makes sure the mirror of `url` has what's needed to resolve `git_ref`
/// (and contains `rev`, if given). Returns the mirror's location and the
/// revision.
#[instrument(skip_all, fields(url = %url, git_ref = %git_ref), err)]
async fn update_mirror(
    ctx: &FetchContext,
    url: &str,
    git_ref: &str,
    rev: Option<&str>,
    all_refs: bool,
    use_head_ref: bool,
) -> Result<(PathBuf, String), Error> {
    let cache_dir = cache_path(&ctx.settings.cache_dir, url);
    if let Some(parent) = cache_dir.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let _lock = PathLock::lock(lock_path(&cache_dir)).await?;

    if tokio::fs::symlink_metadata(&cache_dir).await.is_err() {
        Program::new("git")
            .arg("-c")
            .arg(format!("init.defaultBranch={GIT_INITIAL_BRANCH}"))
            .args(["init", "--bare"])
            .arg(&cache_dir)
            .run()
            .await?;
    }

    let now = SystemTime::now();
    let mut local_ref_file = None;

    let do_fetch = if let Some(rev) = rev {
        match git(&cache_dir, ".")
            .args(["cat-file", "-e", rev])
            .outcome()
            .await
        {
            Outcome::Success(_) => false,
            Outcome::NotFound(_) => true,
            Outcome::Transient(msg) | Outcome::Fatal(msg) => return Err(Error::Fatal(msg)),
        }
    } else if all_refs {
        true
    } else {
        local_ref_file = resolve_ref_file(&cache_dir, git_ref, |path| {
            within_ttl(path, now, ctx.settings.tarball_ttl)
        });
        local_ref_file.is_none()
    };

    if do_fetch {
        info!(url, "fetching Git repository");

        let fetch_ref = if all_refs {
            "refs/*".to_string()
        } else if git_ref.starts_with("refs/") || git_ref == "HEAD" || REV_REGEX.is_match(git_ref)
        {
            git_ref.to_string()
        } else {
            format!("refs/*/{git_ref}")
        };

        let fetched = git(&cache_dir, ".")
            .args(["fetch", "--quiet", "--force", "--", url])
            .arg(format!("{fetch_ref}:{fetch_ref}"))
            .run()
            .await;
        local_ref_file = resolve_ref_file(&cache_dir, git_ref, Path::exists);
        if let Err(e) = fetched {
            if local_ref_file.is_none() {
                return Err(e);
            }
            warn!(url, err = %e, "could not update local clone of Git repository, continuing with the most recent version");
        }

        match &local_ref_file {
            Some(path) => {
                if let Err(e) = filetime::set_file_mtime(path, FileTime::from_system_time(now)) {
                    warn!(path = %path.display(), err = %e, "could not update mtime");
                }
            }
            None => warn!(git_ref, "no local ref file to update the mtime of"),
        }
        if use_head_ref && !store_cached_head(&cache_dir, git_ref).await? {
            warn!(git_ref, url, "could not update cached head");
        }
    }

    let rev = match rev {
        Some(rev) => rev.to_string(),
        None => {
            let path = local_ref_file.ok_or_else(|| {
                Error::NotFound(format!("cannot find ref '{git_ref}' in Git repository '{url}'"))
            })?;
            parse_rev(tokio::fs::read_to_string(&path).await?.trim())?.to_plain_hex_string()
        }
    };
    Ok((cache_dir, rev))
}

/// Writes the tree of `rev` to `dest`.
async fn export_rev(repo_dir: &Path, git_dir: &str, rev: &str, dest: &Path) -> Result<(), Error> {
    let program = git(repo_dir, git_dir).args(["archive", rev]);
    let description = program.description().to_string();
    let (child, stdout) = program.spawn_stdout()?;
    tokio_tar::Archive::new(stdout).unpack(dest).await?;
    wait_checked(child, &description).await
}

/// Checks `rev` out into `dest` together with its submodules.
async fn checkout_with_submodules(
    repo_dir: &Path,
    git_dir: &str,
    rev: &str,
    remote_url: Option<&str>,
    dest: &Path,
) -> Result<(), Error> {
    let tmp_git_dir = tempfile::tempdir()?;

    Program::new("git")
        .arg("-c")
        .arg(format!("init.defaultBranch={GIT_INITIAL_BRANCH}"))
        .arg("init")
        .arg(dest)
        .arg("--separate-git-dir")
        .arg(tmp_git_dir.path())
        .run()
        .await?;

    // the ref may be missing in the repository, so take everything
    debug!(repo = %repo_dir.display(), "making temporary clone");
    Program::new("git")
        .arg("-C")
        .arg(dest)
        .args(["fetch", "--quiet", "--force", "--update-head-ok", "--"])
        .arg(repo_dir)
        .arg("refs/*:refs/*")
        .run()
        .await?;

    Program::new("git")
        .arg("-C")
        .arg(dest)
        .args(["checkout", "--quiet", rev])
        .run()
        .await?;

    // relative submodule URLs resolve against the origin
    let modules = repo_dir.join(git_dir).join("modules");
    match remote_url {
        None => {
            tokio::fs::copy(
                repo_dir.join(git_dir).join("config"),
                tmp_git_dir.path().join("config"),
            )
            .await?;
            Program::new("git")
                .arg("-C")
                .arg(dest)
                .args(["config", "core.bare", "false"])
                .run()
                .await?;
        }
        Some(url) => {
            Program::new("git")
                .arg("-C")
                .arg(dest)
                .args(["config", "remote.origin.url", url])
                .run()
                .await?;
        }
    }

    if modules.exists() {
        debug!(modules = %modules.display(), "copying submodules");
        Program::new("cp")
            .args(["-R", "--"])
            .arg(&modules)
            .arg(tmp_git_dir.path().join("modules"))
            .run()
            .await?;
    }

    info!(repo = %repo_dir.display(), "fetching submodules");
    Program::new("git")
        .arg("-C")
        .arg(dest)
        .args(["submodule", "--quiet", "update", "--init", "--recursive"])
        .run()
        .await?;
    Ok(())
}

/// Fills in what a cached or fresh fetch learned.
fn finish(
    mut attrs: Attrs,
    rev: &str,
    info: &Attrs,
    store_path: StorePath,
    shallow: bool,
) -> Result<(StorePath, Attrs), Error> {
    attrs.insert("rev".into(), Attr::from(rev));
    if !shallow {
        attrs.insert("revCount".into(), Attr::from(get_int(info, "revCount")?));
    }
    attrs.insert(
        "lastModified".into(),
        Attr::from(get_int(info, "lastModified")?),
    );
    Ok((store_path, attrs))
}

impl GitInputScheme {
    /// Whether the repository is a local working tree, and the path (for
    /// those) or URL to get it from.
    fn actual_url(&self, input: &Input<'_>) -> Result<(bool, String), Error> {
        let mut url = parse_url(get_str(input.attrs(), "url")?)?;
        if url.scheme() == "file" {
            let path = decoded_path(&url)?;
            if Path::new(&path).join(".git").exists() {
                return Ok((true, path));
            }
        }
        url.set_query(None);
        url.set_fragment(None);
        Ok((false, url.to_string()))
    }
}

fn parse_url(url: &str) -> Result<Url, Error> {
    Url::parse(url).map_err(|e| Error::bad_url(url, e))
}

#[async_trait]
impl InputScheme for GitInputScheme {
    fn scheme_type(&self) -> &'static str {
        if self.locked {
            "git-locked"
        } else {
            "git"
        }
    }

    fn allowed_attrs(&self) -> &'static [&'static str] {
        ALLOWED_ATTRS
    }

    fn input_from_url(&self, url: &Url) -> Result<Option<Attrs>, Error> {
        if self.locked
            || !matches!(
                url.scheme(),
                "git" | "git+http" | "git+https" | "git+ssh" | "git+file"
            )
        {
            return Ok(None);
        }

        let mut repo_url = match url.scheme().strip_prefix("git+") {
            Some(_) => parse_url(&url.as_str()["git+".len()..])?,
            None => url.clone(),
        };
        repo_url.set_query(None);

        let mut attrs = Attrs::new();
        attrs.insert("type".into(), Attr::from("git"));
        attrs.insert("url".into(), Attr::from(repo_url.to_string()));

        for (name, value) in query_map(url) {
            let attr = match name.as_str() {
                "url" => {
                    return Err(Error::bad_url(
                        url,
                        "the url must not be overridden via a query parameter",
                    ))
                }
                "lastModified" | "revCount" => Attr::from(parse_int_param(url, &name, &value)?),
                "shallow" | "submodules" | "allRefs" => Attr::from(value == "1"),
                _ => Attr::from(value),
            };
            attrs.insert(name, attr);
        }
        Ok(Some(attrs))
    }

    fn preprocess_attrs(&self, attrs: Attrs) -> Result<Attrs, Error> {
        parse_url(get_str(&attrs, "url")?)?;
        for name in ["shallow", "submodules", "allRefs"] {
            maybe_get_bool(&attrs, name)?;
        }
        if let Some(git_ref) = attrs::maybe_get_str(&attrs, "ref")? {
            if is_bad_git_ref(git_ref) {
                return Err(Error::bad_url(
                    git_ref,
                    "invalid Git branch/tag name",
                ));
            }
        }
        Ok(attrs)
    }

    fn to_url(&self, input: &Input<'_>) -> Result<Url, Error> {
        let url = parse_url(get_str(input.attrs(), "url")?)?;
        let mut url = if url.scheme() == "git" {
            url
        } else {
            parse_url(&format!("git+{url}"))?
        };

        let mut query = Vec::new();
        if let Some(git_ref) = input.get_ref()? {
            query.push(("ref", Attr::from(git_ref)));
        }
        if let Some(rev) = input.get_rev()? {
            query.push(("rev", Attr::from(rev.to_plain_hex_string())));
        }
        if flag(input, "shallow")? {
            query.push(("shallow", Attr::from(true)));
        }
        set_query(&mut url, query.iter().map(|(k, v)| (*k, v)));
        Ok(url)
    }

    fn has_all_info(&self, input: &Input<'_>) -> bool {
        if self.locked {
            return true;
        }
        let maybe_dirty = matches!(input.get_ref(), Ok(None));
        let shallow = flag(input, "shallow").unwrap_or(false);
        matches!(input.get_last_modified(), Ok(Some(_)))
            && (shallow || maybe_dirty || matches!(input.get_rev_count(), Ok(Some(_))))
    }

    fn apply_overrides(
        &self,
        attrs: &mut Attrs,
        git_ref: Option<&str>,
        rev: Option<&str>,
    ) -> Result<(), Error> {
        if let Some(rev) = rev {
            attrs.insert("rev".into(), Attr::from(rev));
        }
        if let Some(git_ref) = git_ref {
            attrs.insert("ref".into(), Attr::from(git_ref));
        }
        if !attrs.contains_key("ref") && attrs.contains_key("rev") {
            return Err(Error::Contradictory(format!(
                "Git input '{}' has a commit hash but no branch/tag name",
                attrs::attrs_to_json(attrs)
            )));
        }
        Ok(())
    }

    async fn clone_to(
        &self,
        _ctx: &FetchContext,
        input: &Input<'_>,
        dest: &Path,
    ) -> Result<(), Error> {
        let (_, url) = self.actual_url(input)?;
        if input.get_rev()?.is_some() {
            return Err(Error::Unsupported("cloning a specific revision".into()));
        }
        let git_ref = input.get_ref()?;

        Program::new("git")
            .args(["clone", url.as_str()])
            .args(git_ref.as_deref().map(|r| ["--branch", r]).into_iter().flatten())
            .arg(dest)
            .run()
            .await?;
        Ok(())
    }

    fn get_source_path(&self, input: &Input<'_>) -> Option<PathBuf> {
        let url = parse_url(get_str(input.attrs(), "url").ok()?).ok()?;
        if url.scheme() == "file"
            && matches!(input.get_ref(), Ok(None))
            && matches!(input.get_rev(), Ok(None))
        {
            return decoded_path(&url).ok().map(PathBuf::from);
        }
        None
    }

    async fn put_file(
        &self,
        input: &Input<'_>,
        path: &Path,
        contents: &[u8],
        commit_msg: Option<&str>,
    ) -> Result<(), Error> {
        let root = self.get_source_path(input).ok_or_else(|| {
            Error::Unsupported(format!(
                "committing '{}' to '{input}', which is not a working tree,",
                path.display()
            ))
        })?;

        let dest = root.join(path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, contents).await?;

        let ignored = git(&root, ".git")
            .args(["check-ignore", "--quiet"])
            .arg(path)
            .output()
            .await?
            .status
            .success();
        if ignored {
            debug!(path = %path.display(), "not adding ignored file");
            return Ok(());
        }

        git(&root, ".git")
            .args(["add", "--intent-to-add", "--"])
            .arg(path)
            .run()
            .await?;

        if let Some(msg) = commit_msg {
            let msg_file = tempfile::NamedTempFile::new()?;
            tokio::fs::write(msg_file.path(), msg).await?;
            git(&root, ".git")
                .arg("commit")
                .arg(path)
                .arg("-F")
                .arg(msg_file.path())
                .run()
                .await?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(input = %input), err)]
    async fn fetch(
        &self,
        ctx: &FetchContext,
        input: &Input<'_>,
    ) -> Result<(StorePath, Attrs), Error> {
        let name = input.get_name();
        let shallow = flag(input, "shallow")?;
        let submodules = flag(input, "submodules")?;
        let all_refs = flag(input, "allRefs")?;

        let mut cache_type = String::from("git");
        if shallow {
            cache_type.push_str("-shallow");
        }
        if submodules {
            cache_type.push_str("-submodules");
        }
        if all_refs {
            cache_type.push_str("-all-refs");
        }
        let locked_key = |rev: &str| {
            attrs::attrs([
                ("type", cache_type.as_str()),
                ("name", name.as_str()),
                ("rev", rev),
            ])
        };

        let mut result = input.to_attrs();
        let input_rev = input.get_rev()?.map(|rev| rev.to_plain_hex_string());

        if let Some(rev) = &input_rev {
            if let Some((info, store_path)) =
                ctx.cache.lookup(ctx.store.as_ref(), &locked_key(rev)).await?
            {
                return finish(result, rev, &info, store_path, shallow);
            }
        }

        let (is_local, actual_url) = self.actual_url(input)?;

        // local working trees can be fetched as they are when nothing
        // pins a commit
        if is_local && input.get_ref()?.is_none() && input_rev.is_none() {
            let workdir = Path::new(&actual_url);
            let info = workdir_info(workdir, submodules).await?;
            if !info.clean {
                return fetch_from_workdir(ctx, input, workdir, info, submodules).await;
            }
        }

        let mut unlocked_key = attrs::attrs([
            ("type", cache_type.as_str()),
            ("name", name.as_str()),
            ("url", actual_url.as_str()),
        ]);

        let (repo_dir, git_dir, git_ref, rev) = if is_local {
            let repo_dir = PathBuf::from(&actual_url);
            let git_ref = match input.get_ref()? {
                Some(git_ref) => git_ref,
                None => {
                    let head = read_head(&actual_url).await.unwrap_or_else(|| {
                        warn!(url = %actual_url, "could not read HEAD ref from repo, using 'master'");
                        "master".into()
                    });
                    unlocked_key.insert("ref".into(), Attr::from(head.as_str()));
                    head
                }
            };
            let rev = match &input_rev {
                Some(rev) => rev.clone(),
                None => {
                    let out = git(&repo_dir, ".git")
                        .args(["rev-parse", git_ref.as_str()])
                        .run()
                        .await?;
                    parse_rev(out.trim())?.to_plain_hex_string()
                }
            };
            (repo_dir, ".git", git_ref, rev)
        } else {
            let use_head_ref = input.get_ref()?.is_none();
            let git_ref = match input.get_ref()? {
                Some(git_ref) => {
                    if input_rev.is_none() {
                        unlocked_key.insert("ref".into(), Attr::from(git_ref.as_str()));
                    }
                    git_ref
                }
                None => {
                    let head = read_head_cached(ctx, &actual_url).await.unwrap_or_else(|| {
                        warn!(url = %actual_url, "could not read HEAD ref from repo, using 'master'");
                        "master".into()
                    });
                    unlocked_key.insert("ref".into(), Attr::from(head.as_str()));
                    head
                }
            };

            if let Some((info, store_path)) =
                ctx.cache.lookup(ctx.store.as_ref(), &unlocked_key).await?
            {
                let cached_rev = parse_rev(get_str(&info, "rev")?)?.to_plain_hex_string();
                if input_rev.as_ref().map_or(true, |rev| *rev == cached_rev) {
                    result.insert("ref".into(), Attr::from(git_ref));
                    return finish(result, &cached_rev, &info, store_path, shallow);
                }
            }

            let (mirror, rev) = update_mirror(
                ctx,
                &actual_url,
                &git_ref,
                input_rev.as_deref(),
                all_refs,
                use_head_ref,
            )
            .await?;
            (mirror, ".", git_ref, rev)
        };
        result.insert("ref".into(), Attr::from(git_ref.as_str()));

        let is_shallow = git(&repo_dir, git_dir)
            .args(["rev-parse", "--is-shallow-repository"])
            .run()
            .await?
            .trim()
            == "true";
        if is_shallow && !shallow {
            return Err(Error::Integrity(format!(
                "'{actual_url}' is a shallow Git repository, but shallow repositories are only allowed when `shallow = true;` is specified"
            )));
        }

        debug!(rev, url = %actual_url, "using revision");

        if let Some((info, store_path)) =
            ctx.cache.lookup(ctx.store.as_ref(), &locked_key(&rev)).await?
        {
            return finish(result, &rev, &info, store_path, shallow);
        }

        let program = git(&repo_dir, git_dir).args(["cat-file", "commit", rev.as_str()]);
        let description = program.description().to_string();
        let output = program.output().await?;
        if !output.status.success() {
            if output.status.code() == Some(128)
                && String::from_utf8_lossy(&output.stderr).contains("bad file")
            {
                return Err(Error::NotFound(format!(
                    "cannot find Git revision '{rev}' in ref '{git_ref}' of repository '{actual_url}', make sure the rev exists on the ref or set allRefs"
                )));
            }
            return Err(failed(&description, &output));
        }

        let tmp = tempfile::tempdir()?;
        let filter: Option<Arc<PathFilter>> = if submodules {
            let remote_url = (!is_local).then_some(actual_url.as_str());
            checkout_with_submodules(&repo_dir, git_dir, &rev, remote_url, tmp.path()).await?;
            Some(Arc::new(|path: &Path| {
                path.file_name() != Some(OsStr::new(".git"))
            }))
        } else {
            export_rev(&repo_dir, git_dir, &rev, tmp.path()).await?;
            None
        };

        let store_path = ctx
            .store
            .add_to_store_recursive(&name, tmp.path(), filter)
            .await?;

        let out = git(&repo_dir, git_dir)
            .args(["log", "-1", "--format=%ct", "--no-show-signature", rev.as_str()])
            .run()
            .await?;
        let mut info = attrs::attrs([
            ("rev", Attr::from(rev.as_str())),
            ("lastModified", Attr::from(parse_number(&out, "commit time")?)),
        ]);
        if !shallow {
            let out = git(&repo_dir, git_dir)
                .args(["rev-list", "--count", rev.as_str()])
                .run()
                .await?;
            info.insert(
                "revCount".into(),
                Attr::from(parse_number(&out, "revision count")?),
            );
        }

        if input_rev.is_none() {
            ctx.cache.add(&unlocked_key, &info, &store_path, false).await?;
        }
        ctx.cache
            .add(&locked_key(&rev), &info, &store_path, true)
            .await?;

        finish(result, &rev, &info, store_path, shallow)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use crate::{
        attrs::{attrs, Attr},
        tests::fixtures::{context, git, have_git, make_repo},
        ErrorKind, FetchSettings, Registry,
    };

    const REV: &str = "7f8d3a8c1a2a6f5d2e0c9b1f0e4d3c2b1a098765";

    fn file_url(path: &Path) -> String {
        format!("git+file://{}", path.display())
    }

    #[rstest]
    #[case::https(
        "git+https://example.org/repo.git?ref=main&shallow=1",
        "git+https://example.org/repo.git?ref=main&shallow=1"
    )]
    #[case::plain_git("git://example.org/repo", "git://example.org/repo")]
    #[case::file("git+file:///tmp/repo", "git+file:///tmp/repo")]
    #[case::ssh(
        "git+ssh://git@example.org/repo?rev=7f8d3a8c1a2a6f5d2e0c9b1f0e4d3c2b1a098765&ref=v1",
        "git+ssh://git@example.org/repo?ref=v1&rev=7f8d3a8c1a2a6f5d2e0c9b1f0e4d3c2b1a098765"
    )]
    #[case::dropped_flags(
        "git+https://example.org/repo.git?submodules=1&shallow=0",
        "git+https://example.org/repo.git"
    )]
    fn url_roundtrip(#[case] url: &str, #[case] expected: &str) {
        let registry = Registry::with_builtin_schemes();
        let input = registry.input_from_url(url).unwrap();
        assert_eq!("git", input.get_type());
        assert_eq!(expected, input.to_url_string().unwrap());
    }

    #[test]
    fn parsed_attrs() {
        let registry = Registry::with_builtin_schemes();
        let input = registry
            .input_from_url("git+https://example.org/repo.git?ref=main&shallow=1&revCount=3")
            .unwrap();
        assert_eq!(
            &attrs([
                ("type", Attr::from("git")),
                ("url", Attr::from("https://example.org/repo.git")),
                ("ref", Attr::from("main")),
                ("shallow", Attr::from(true)),
                ("revCount", Attr::from(3u64)),
            ]),
            input.attrs()
        );
    }

    #[rstest]
    #[case::url_param("git+https://example.org/repo.git?url=https://evil.example")]
    #[case::bad_ref("git+https://example.org/repo.git?ref=a..b")]
    #[case::bad_count("git+https://example.org/repo.git?revCount=lots")]
    #[case::unknown_param("git+https://example.org/repo.git?depth=1")]
    fn bad_urls(#[case] url: &str) {
        let registry = Registry::with_builtin_schemes();
        let err = registry.input_from_url(url).expect_err("must fail");
        assert_eq!(ErrorKind::Malformed, err.kind(), "{err}");
    }

    #[rstest]
    #[case::nothing(&[], false)]
    #[case::no_ref(&[("lastModified", Attr::Int(1))], true)]
    #[case::ref_without_count(&[("lastModified", Attr::Int(1)), ("ref", Attr::String("main".into()))], false)]
    #[case::ref_with_count(
        &[("lastModified", Attr::Int(1)), ("ref", Attr::String("main".into())), ("revCount", Attr::Int(2))],
        true
    )]
    #[case::shallow(
        &[("lastModified", Attr::Int(1)), ("ref", Attr::String("main".into())), ("shallow", Attr::Bool(true))],
        true
    )]
    fn has_all_info(#[case] extra: &[(&str, Attr)], #[case] expected: bool) {
        let registry = Registry::with_builtin_schemes();
        let mut input_attrs = attrs([("type", "git"), ("url", "https://example.org/repo.git")]);
        for (name, value) in extra {
            input_attrs.insert(name.to_string(), value.clone());
        }
        let input = registry.input_from_attrs(input_attrs).unwrap();
        assert_eq!(expected, input.scheme().has_all_info(&input));
    }

    #[test]
    fn locked_variant() {
        let registry = Registry::with_builtin_schemes();
        let input = registry
            .input_from_attrs(attrs([
                ("type", "git-locked"),
                ("url", "https://example.org/repo.git"),
            ]))
            .unwrap();
        assert_eq!("git-locked", input.get_type());
        assert!(input.scheme().has_all_info(&input));

        // URLs always map to the plain scheme
        let input = registry
            .input_from_url("git+https://example.org/repo.git")
            .unwrap();
        assert_eq!("git", input.get_type());
    }

    #[test]
    fn overrides_need_a_ref_for_a_rev() {
        let registry = Registry::with_builtin_schemes();
        let input = registry
            .input_from_url("git+https://example.org/repo.git")
            .unwrap();

        let err = input.apply_overrides(None, Some(REV)).expect_err("must fail");
        assert_eq!(ErrorKind::Contradictory, err.kind());

        let pinned = input.apply_overrides(Some("main"), Some(REV)).unwrap();
        assert_eq!(
            format!("git+https://example.org/repo.git?ref=main&rev={REV}"),
            pinned.to_url_string().unwrap()
        );
        assert!(pinned.is_locked());
    }

    #[rstest]
    #[case::fresh(100, 99, true)]
    #[case::at_ttl(100, 100, false)]
    #[case::huge_ttl(u64::MAX, 1_000_000, true)]
    fn ref_file_ttl(#[case] ttl: u64, #[case] elapsed: u64, #[case] fresh: bool) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main");
        std::fs::write(&file, REV).unwrap();
        let mtime = std::fs::metadata(&file).unwrap().modified().unwrap();

        let now = mtime + std::time::Duration::from_secs(elapsed);
        assert_eq!(fresh, super::within_ttl(&file, now, ttl));
        assert!(!super::within_ttl(&dir.path().join("missing"), now, ttl));
    }

    #[test]
    fn source_path() {
        let registry = Registry::with_builtin_schemes();
        let local = registry.input_from_url("git+file:///src/repo").unwrap();
        assert_eq!(Some("/src/repo".into()), local.get_source_path());

        let pinned = registry
            .input_from_url("git+file:///src/repo?ref=main")
            .unwrap();
        assert_eq!(None, pinned.get_source_path());

        let remote = registry
            .input_from_url("git+https://example.org/repo.git")
            .unwrap();
        assert_eq!(None, remote.get_source_path());
    }

    #[tokio::test]
    async fn fetch_clean_workdir() {
        if !have_git() {
            return;
        }
        let (dir, ctx) = context(FetchSettings::default()).await;
        let repo = make_repo(dir.path(), "repo");
        let head = git(&repo, &["rev-parse", "HEAD"]);

        let registry = Registry::with_builtin_schemes();
        let input = registry.input_from_url(&file_url(&repo)).unwrap();
        let (tree, locked) = input.fetch(&ctx).await.unwrap();

        assert_eq!(Some(head.clone()), locked.get_rev().unwrap().map(|r| r.to_plain_hex_string()));
        assert_eq!(Some("refs/heads/main".to_string()), locked.get_ref().unwrap());
        assert_eq!(Some(2), locked.get_rev_count().unwrap());
        assert_eq!(Some(1700000000), locked.get_last_modified().unwrap());

        let out = tree.actual_path.unwrap();
        assert_eq!("hello world\n", std::fs::read_to_string(out.join("hello.txt")).unwrap());
        assert!(!out.join(".git").exists());

        // a second fetch is answered from the cache
        let (again, _) = input.fetch(&ctx).await.unwrap();
        assert_eq!(tree.store_path, again.store_path);
    }

    #[tokio::test]
    async fn fetch_older_rev() {
        if !have_git() {
            return;
        }
        let (dir, ctx) = context(FetchSettings::default()).await;
        let repo = make_repo(dir.path(), "repo");
        let first = git(&repo, &["rev-parse", "HEAD~1"]);

        let registry = Registry::with_builtin_schemes();
        let input = registry
            .input_from_url(&format!("{}?ref=main&rev={first}", file_url(&repo)))
            .unwrap();
        let (tree, locked) = input.fetch(&ctx).await.unwrap();

        assert_eq!(Some(1), locked.get_rev_count().unwrap());
        assert_eq!(
            "hello\n",
            std::fs::read_to_string(tree.actual_path.unwrap().join("hello.txt")).unwrap()
        );
    }

    #[tokio::test]
    async fn dirty_workdir() {
        if !have_git() {
            return;
        }
        let (dir, ctx) = context(FetchSettings::default()).await;
        let repo = make_repo(dir.path(), "repo");
        let head = git(&repo, &["rev-parse", "HEAD"]);
        std::fs::write(repo.join("hello.txt"), "dirty\n").unwrap();
        std::fs::write(repo.join("untracked.txt"), "not added\n").unwrap();

        let registry = Registry::with_builtin_schemes();
        let input = registry.input_from_url(&file_url(&repo)).unwrap();
        let (tree, locked) = input.fetch(&ctx).await.unwrap();

        assert_eq!(None, locked.get_rev().unwrap());
        assert_eq!(
            Some(&Attr::from(format!("{head}-dirty"))),
            locked.attrs().get("dirtyRev")
        );
        assert_eq!(Some(1700000000), locked.get_last_modified().unwrap());

        let out = tree.actual_path.unwrap();
        assert_eq!("dirty\n", std::fs::read_to_string(out.join("hello.txt")).unwrap());
        assert!(!out.join("untracked.txt").exists());
        assert!(!out.join(".git").exists());
    }

    #[tokio::test]
    async fn dirty_workdir_can_be_forbidden() {
        if !have_git() {
            return;
        }
        let settings = FetchSettings {
            allow_dirty: false,
            ..FetchSettings::default()
        };
        let (dir, ctx) = context(settings).await;
        let repo = make_repo(dir.path(), "repo");
        std::fs::write(repo.join("hello.txt"), "dirty\n").unwrap();

        let registry = Registry::with_builtin_schemes();
        let input = registry.input_from_url(&file_url(&repo)).unwrap();
        let err = input.fetch(&ctx).await.expect_err("must fail");
        assert_eq!(ErrorKind::Integrity, err.kind());
        assert!(err.to_string().contains("is dirty"), "{err}");
    }

    #[tokio::test]
    async fn fetch_through_mirror() {
        if !have_git() {
            return;
        }
        let (dir, ctx) = context(FetchSettings::default()).await;
        let repo = make_repo(dir.path(), "repo");
        let first = git(&repo, &["rev-parse", "HEAD~1"]);
        let head = git(&repo, &["rev-parse", "HEAD"]);
        git(dir.path(), &["clone", "--quiet", "--bare", "repo", "bare.git"]);
        let bare = dir.path().join("bare.git");

        let registry = Registry::with_builtin_schemes();
        let input = registry.input_from_url(&file_url(&bare)).unwrap();
        let (tree, locked) = input.fetch(&ctx).await.unwrap();

        assert_eq!(Some(head), locked.get_rev().unwrap().map(|r| r.to_plain_hex_string()));
        assert_eq!(Some(2), locked.get_rev_count().unwrap());
        assert_eq!(
            "hello world\n",
            std::fs::read_to_string(tree.actual_path.unwrap().join("hello.txt")).unwrap()
        );
        assert!(ctx.settings.cache_dir.join("gitv3").is_dir());

        // tags resolve through the mirror too
        let tagged = registry
            .input_from_url(&format!("{}?ref=v1", file_url(&bare)))
            .unwrap();
        let (_, locked) = tagged.fetch(&ctx).await.unwrap();
        assert_eq!(Some(2), locked.get_rev_count().unwrap());

        let old = registry
            .input_from_url(&format!("{}?ref=main&rev={first}", file_url(&bare)))
            .unwrap();
        let (tree, _) = old.fetch(&ctx).await.unwrap();
        assert_eq!(
            "hello\n",
            std::fs::read_to_string(tree.actual_path.unwrap().join("hello.txt")).unwrap()
        );
    }

    #[tokio::test]
    async fn missing_revision() {
        if !have_git() {
            return;
        }
        let (dir, ctx) = context(FetchSettings::default()).await;
        let repo = make_repo(dir.path(), "repo");

        let registry = Registry::with_builtin_schemes();
        let input = registry
            .input_from_url(&format!(
                "{}?ref=main&rev=1111111111111111111111111111111111111111",
                file_url(&repo)
            ))
            .unwrap();
        let err = input.fetch(&ctx).await.expect_err("must fail");
        assert_eq!(ErrorKind::NotFound, err.kind(), "{err}");
    }

    #[tokio::test]
    async fn shallow_repos_need_shallow() {
        if !have_git() {
            return;
        }
        let (dir, ctx) = context(FetchSettings::default()).await;
        let repo = make_repo(dir.path(), "repo");
        git(
            dir.path(),
            &[
                "clone",
                "--quiet",
                "--depth",
                "1",
                &format!("file://{}", repo.display()),
                "shallow",
            ],
        );
        let shallow = dir.path().join("shallow");

        let registry = Registry::with_builtin_schemes();
        let input = registry.input_from_url(&file_url(&shallow)).unwrap();
        let err = input.fetch(&ctx).await.expect_err("must fail");
        assert_eq!(ErrorKind::Integrity, err.kind());

        let input = registry
            .input_from_url(&format!("{}?shallow=1", file_url(&shallow)))
            .unwrap();
        let (_, locked) = input.fetch(&ctx).await.unwrap();
        assert_eq!(None, locked.get_rev_count().unwrap());
        assert_eq!(Some(1700000000), locked.get_last_modified().unwrap());
    }

    #[tokio::test]
    async fn clone_to() {
        if !have_git() {
            return;
        }
        let (dir, ctx) = context(FetchSettings::default()).await;
        let repo = make_repo(dir.path(), "repo");

        let registry = Registry::with_builtin_schemes();
        let input = registry
            .input_from_url(&format!("{}?ref=v1", file_url(&repo)))
            .unwrap();
        let dest = dir.path().join("checkout");
        input.clone_to(&ctx, &dest).await.unwrap();
        assert_eq!(
            "hello world\n",
            std::fs::read_to_string(dest.join("hello.txt")).unwrap()
        );

        let pinned = input
            .apply_overrides(None, Some(&git(&repo, &["rev-parse", "HEAD"])))
            .unwrap();
        let err = pinned
            .clone_to(&ctx, &dir.path().join("other"))
            .await
            .expect_err("must fail");
        assert_eq!(ErrorKind::Fatal, err.kind());
    }

    #[tokio::test]
    async fn put_file_commits() {
        if !have_git() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = make_repo(dir.path(), "repo");
        for (key, value) in [
            ("user.name", "Test"),
            ("user.email", "test@example.org"),
            ("commit.gpgsign", "false"),
        ] {
            git(&repo, &["config", key, value]);
        }
        std::fs::write(repo.join(".gitignore"), "ignored.txt\n").unwrap();

        let registry = Registry::with_builtin_schemes();
        let input = registry.input_from_url(&file_url(&repo)).unwrap();
        input
            .put_file(Path::new("flake.lock"), b"{}", Some("add lock file"))
            .await
            .unwrap();
        assert_eq!("add lock file", git(&repo, &["log", "-1", "--format=%s"]));
        assert_eq!("", git(&repo, &["status", "--porcelain", "flake.lock"]));

        input
            .put_file(Path::new("ignored.txt"), b"x", None)
            .await
            .unwrap();
        assert_eq!("", git(&repo, &["ls-files", "ignored.txt"]));

        let remote = registry
            .input_from_url("git+https://example.org/repo.git")
            .unwrap();
        assert!(remote.put_file(Path::new("x"), b"", None).await.is_err());
    }
}
