use crate::nixbase32;
use crate::nixhash::{compress_hash, CAHash, NixHash};
use crate::store_path::{Error, StorePath, DRV_EXTENSION, STORE_DIR};
use sha2::{Digest, Sha256};

/// Errors that can occur when creating a content-addressed store path.
///
/// This wraps the main [crate::store_path::Error].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum BuildStorePathError {
    #[error("Invalid Store Path: {0}")]
    InvalidStorePath(Error),
    /// References are only allowed for text hashes and sha256 NAR hashes.
    #[error("References were not supported as much as requested")]
    InvalidReference(),
}

/// Builds the store path of a text file (`builtins.toFile`, derivations),
/// from its contents and references.
/// If you don't want to have to pass the entire contents, you might want to use
/// [build_ca_path] instead.
pub fn build_text_path<S: AsRef<str>, I: IntoIterator<Item = S>, C: AsRef<[u8]>>(
    name: &str,
    content: C,
    references: I,
) -> Result<StorePath, BuildStorePathError> {
    let content_digest = Sha256::new_with_prefix(content).finalize().into();

    build_ca_path(name, &CAHash::Text(content_digest), references, false)
}

/// This builds a store path from a [CAHash] and a list of references.
pub fn build_ca_path<B: AsRef<[u8]>, S: AsRef<str>, I: IntoIterator<Item = S>>(
    name: B,
    ca_hash: &CAHash,
    references: I,
    self_reference: bool,
) -> Result<StorePath, BuildStorePathError> {
    let (ty, hash) = match ca_hash {
        CAHash::Text(digest) => {
            if self_reference {
                return Err(BuildStorePathError::InvalidReference());
            }
            (
                make_references_string("text", references, false),
                NixHash::Sha256(*digest),
            )
        }
        CAHash::Nar(hash @ NixHash::Sha256(_)) => (
            make_references_string("source", references, self_reference),
            hash.clone(),
        ),
        // all other fixed outputs hash an inner fingerprint, with `r:` for NAR.
        CAHash::Nar(hash) | CAHash::Flat(hash) => {
            if self_reference || references.into_iter().next().is_some() {
                return Err(BuildStorePathError::InvalidReference());
            }
            let method = if matches!(ca_hash, CAHash::Nar(_)) { "r:" } else { "" };
            (
                "output:out".to_string(),
                NixHash::Sha256(
                    Sha256::new_with_prefix(format!(
                        "fixed:out:{}{}:",
                        method,
                        hash.to_nix_hex_string()
                    ))
                    .finalize()
                    .into(),
                ),
            )
        }
    };

    build_store_path_from_fingerprint_parts(&ty, &hash, name)
        .map_err(BuildStorePathError::InvalidStorePath)
}

/// For given NAR sha256 digest and name, return the new [StorePath] this would have.
pub fn build_nar_based_store_path(
    nar_sha256_digest: &[u8; 32],
    name: &str,
) -> Result<StorePath, Error> {
    build_store_path_from_fingerprint_parts(
        "source",
        &NixHash::Sha256(*nar_sha256_digest),
        name,
    )
}

/// This builds an input-addressed store path.
///
/// Input-addresed store paths are always derivation outputs, the "input" in question is the
/// derivation and its closure.
pub fn build_output_path(
    drv_hash: &NixHash,
    output_name: &str,
    output_path_name: &str,
) -> Result<StorePath, Error> {
    build_store_path_from_fingerprint_parts(
        &(String::from("output:") + output_name),
        drv_hash,
        output_path_name,
    )
}

/// This builds a store path from fingerprint parts.
///
/// The fingerprint `$ty:$algo:$hexdigest:$storedir:$name` is hashed with
/// sha256, and its digest is compressed to 20 bytes.
pub fn build_store_path_from_fingerprint_parts<B: AsRef<[u8]>>(
    ty: &str,
    hash: &NixHash,
    name: B,
) -> Result<StorePath, Error> {
    let name = super::validate_name(name.as_ref())?;
    let fingerprint =
        String::from(ty) + ":" + &hash.to_nix_hex_string() + ":" + STORE_DIR + ":" + &name;
    let digest = Sha256::new_with_prefix(fingerprint).finalize();

    Ok(StorePath {
        digest: compress_hash::<20>(&digest),
        name,
    })
}

/// The name of the store path of output `output_name` of a derivation named
/// `drv_name` (without `.drv`). Outputs other than `out` get a suffix.
pub fn output_path_name(drv_name: &str, output_name: &str) -> String {
    let drv_name = drv_name.strip_suffix(DRV_EXTENSION).unwrap_or(drv_name);
    if output_name == "out" {
        drv_name.to_string()
    } else {
        format!("{}-{}", drv_name, output_name)
    }
}

/// Creates the "type" part of a fingerprint: `$ty:$ref1:$ref2[:self]`.
fn make_references_string<S: AsRef<str>, I: IntoIterator<Item = S>>(
    ty: &str,
    references: I,
    self_ref: bool,
) -> String {
    let mut s = String::from(ty);

    for reference in references {
        s.push(':');
        s.push_str(reference.as_ref());
    }

    if self_ref {
        s.push_str(":self");
    }

    s
}

/// Placeholders (i.e. values returned by `builtins.placeholder`) stand in for
/// output paths that are not known yet, and get string-replaced at build time.
pub fn hash_placeholder(name: &str) -> String {
    let digest = Sha256::new_with_prefix(format!("nix-output:{}", name)).finalize();

    format!("/{}", nixbase32::encode(&digest))
}

/// The placeholder for output `output_name` of a floating content-addressed
/// derivation at `drv_path`, whose output path is only known after building.
pub fn downstream_placeholder(drv_path: &StorePath, output_name: &str) -> String {
    let clear_text = format!(
        "nix-upstream-output:{}:{}",
        drv_path.hash_part(),
        output_path_name(drv_path.name(), output_name)
    );
    let digest = Sha256::new_with_prefix(clear_text).finalize();

    format!("/{}", nixbase32::encode(&digest))
}
