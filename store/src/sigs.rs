//! Operations adding or checking signatures on many paths at once.

use std::sync::{mpsc, Arc};

use ferrix_compat::{
    narinfo::{SigningKey, VerifyingKey},
    nixhash::NixHash,
    store_path::StorePath,
};
use futures::{stream, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use threadpool::ThreadPool;
use tracing::{debug, info, instrument, warn};

use crate::{Error, PathInfo, Store};

/// How many paths are worked on at the same time.
const CONCURRENCY: usize = 16;

/// Copies signatures of `paths` from `substituters` into `store`, taking
/// only those from substituters that agree on the NAR hash, NAR size and
/// references. Returns how many signatures were added.
#[instrument(skip_all, fields(store = %store.uri(), paths = paths.len()), err)]
pub async fn copy_sigs(
    store: &dyn Store,
    substituters: &[Arc<dyn Store>],
    paths: &[StorePath],
) -> Result<usize, Error> {
    let added = stream::iter(paths)
        .map(|path| copy_sigs_for_path(store, substituters, path))
        .buffer_unordered(CONCURRENCY)
        .try_fold(0, |total, n| async move { Ok(total + n) })
        .await?;

    info!(added, "copied signatures");
    Ok(added)
}

async fn copy_sigs_for_path(
    store: &dyn Store,
    substituters: &[Arc<dyn Store>],
    path: &StorePath,
) -> Result<usize, Error> {
    let info = store
        .query_path_info(path)
        .await?
        .ok_or_else(|| Error::InvalidPath(path.clone()))?;

    let mut new_sigs = vec![];
    for substituter in substituters {
        let other = match substituter.query_path_info(path).await {
            Ok(Some(other)) => other,
            Ok(None) => continue,
            Err(e) => {
                warn!(substituter = %substituter.uri(), err = %e, "unable to query substituter");
                continue;
            }
        };

        if other.nar_sha256 != info.nar_sha256
            || other.nar_size != info.nar_size
            || other.references != info.references
        {
            warn!(
                substituter = %substituter.uri(),
                path = %path,
                "substituter has an incompatible path"
            );
            continue;
        }

        for sig in other.signatures {
            if !info.signatures.contains(&sig) && !new_sigs.contains(&sig) {
                new_sigs.push(sig);
            }
        }
    }

    let added = new_sigs.len();
    if added > 0 {
        store.add_signatures(path, new_sigs).await?;
    }
    Ok(added)
}

/// Signs `paths` in `store` with `signing_key`, fanning the signing out to
/// `threads` threads. Returns how many paths got a new signature.
#[instrument(skip_all, fields(store = %store.uri(), paths = paths.len()), err)]
pub async fn sign_paths(
    store: &dyn Store,
    paths: &[StorePath],
    signing_key: Arc<SigningKey<ed25519_dalek::SigningKey>>,
    threads: usize,
) -> Result<usize, Error> {
    let infos: Vec<PathInfo> = stream::iter(paths)
        .map(|path| async move {
            store
                .query_path_info(path)
                .await?
                .ok_or_else(|| Error::InvalidPath(path.clone()))
        })
        .buffered(CONCURRENCY)
        .try_collect()
        .await?;

    let signed = tokio::task::spawn_blocking(move || sign_all(infos, signing_key, threads)).await?;

    let mut added = 0;
    for info in signed {
        store
            .add_signatures(&info.store_path, info.signatures)
            .await?;
        added += 1;
    }

    info!(added, "signed paths");
    Ok(added)
}

/// Signs every info on a thread pool, returning only those that changed.
fn sign_all(
    infos: Vec<PathInfo>,
    signing_key: Arc<SigningKey<ed25519_dalek::SigningKey>>,
    threads: usize,
) -> Vec<PathInfo> {
    let pool = ThreadPool::new(threads.max(1));
    let (tx, rx) = mpsc::channel();

    for mut info in infos {
        let tx = tx.clone();
        let signing_key = signing_key.clone();
        pool.execute(move || {
            let before = info.signatures.len();
            info.sign(&signing_key);
            if info.signatures.len() > before {
                // the receiver outlives the pool
                let _ = tx.send(info);
            }
        });
    }
    drop(tx);

    rx.iter().collect()
}

/// What to check in [verify_paths].
#[derive(Clone, Debug)]
pub struct VerifyOptions {
    /// Hash the NAR of each path and compare it to the recorded hash.
    pub check_contents: bool,
    /// Require signatures (or a content address) to trust each path.
    pub check_trust: bool,
    pub trusted_keys: Vec<VerifyingKey>,
    pub sigs_needed: usize,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            check_contents: true,
            check_trust: true,
            trusted_keys: vec![],
            sigs_needed: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VerifyResult {
    pub untrusted: usize,
    pub corrupted: usize,
}

#[derive(Clone, Copy, Default)]
struct PathVerdict {
    untrusted: bool,
    corrupted: bool,
}

/// Checks many paths concurrently, counting those whose contents don't
/// match their NAR hash and those that aren't trusted.
#[instrument(skip_all, fields(store = %store.uri(), paths = paths.len()))]
pub async fn verify_paths(
    store: &dyn Store,
    paths: &[StorePath],
    options: &VerifyOptions,
) -> VerifyResult {
    let verdicts: Vec<PathVerdict> = stream::iter(paths)
        .map(|path| async move {
            match verify_path(store, path, options).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(path = %path, err = %e, "unable to verify path");
                    PathVerdict {
                        untrusted: false,
                        corrupted: true,
                    }
                }
            }
        })
        .buffer_unordered(CONCURRENCY)
        .collect()
        .await;

    let result = verdicts
        .iter()
        .fold(VerifyResult::default(), |mut acc, verdict| {
            acc.untrusted += usize::from(verdict.untrusted);
            acc.corrupted += usize::from(verdict.corrupted);
            acc
        });
    info!(
        untrusted = result.untrusted,
        corrupted = result.corrupted,
        "verified paths"
    );
    result
}

async fn verify_path(
    store: &dyn Store,
    path: &StorePath,
    options: &VerifyOptions,
) -> Result<PathVerdict, Error> {
    let info = store
        .query_path_info(path)
        .await?
        .ok_or_else(|| Error::InvalidPath(path.clone()))?;
    let mut verdict = PathVerdict::default();

    if options.check_contents {
        let nar = store.nar_from_path(path).await?;
        let (got, size) =
            tokio::task::spawn_blocking(move || (<[u8; 32]>::from(Sha256::digest(&nar)), nar.len()))
                .await?;

        if got != info.nar_sha256 || size as u64 != info.nar_size {
            warn!(
                path = %path,
                expected = %NixHash::Sha256(info.nar_sha256).to_sri_string(),
                got = %NixHash::Sha256(got).to_sri_string(),
                "path was modified"
            );
            verdict.corrupted = true;
        }
    }

    if options.check_trust && !info.is_trusted(&options.trusted_keys, options.sigs_needed) {
        warn!(path = %path, "path is untrusted");
        verdict.untrusted = true;
    } else {
        debug!(path = %path, "path is fine");
    }

    Ok(verdict)
}
