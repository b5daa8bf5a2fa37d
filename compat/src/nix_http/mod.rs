//! Object names used in the HTTP binary cache layout.

use tracing::trace;

use crate::{nixbase32, store_path::StorePath};

/// Name of the file describing the cache itself.
pub const CACHE_INFO_FILE: &str = "nix-cache-info";

/// Returns the `$hashpart.narinfo` file name for a store path.
pub fn narinfo_file_name(store_path: &StorePath) -> String {
    format!("{}.narinfo", store_path.hash_part())
}

/// Returns the file name extension used for a compression method, or
/// None for methods that aren't known.
pub fn compression_extension(compression: Option<&str>) -> Option<&'static str> {
    match compression {
        None | Some("none") => Some(""),
        Some("xz") => Some(".xz"),
        Some("bzip2") => Some(".bz2"),
        Some("gzip") => Some(".gz"),
        Some("zstd") => Some(".zst"),
        Some("br") => Some(".br"),
        Some(_) => None,
    }
}

/// Returns `nar/$nixbase32(file_hash).nar$ext`.
pub fn nar_url(file_hash: &[u8; 32], extension: &str) -> String {
    format!("nar/{}.nar{}", nixbase32::encode(file_hash), extension)
}

/// Parses a `14cx20k6z4hq508kqi2lm79qfld5f9mf7kiafpqsjs3zlmycza0k.nar`
/// string and returns the nixbase32-decoded digest, as well as the compression
/// suffix (which might be empty).
pub fn parse_nar_str(s: &str) -> Option<([u8; 32], &str)> {
    if !s.is_char_boundary(52) {
        trace!("invalid string, no char boundary at 52");
        return None;
    }

    let (hash_str, suffix) = s.split_at(52);

    match suffix.strip_prefix(".nar") {
        Some(compression_suffix) => match nixbase32::decode_fixed(hash_str) {
            Err(e) => {
                trace!(err=%e, "invalid nixbase32 encoding");
                None
            }
            Ok(digest) => Some((digest, compression_suffix)),
        },
        None => {
            trace!("no .nar suffix");
            None
        }
    }
}

/// Parses a `3mzh8lvgbynm9daj7c82k2sfsfhrsfsy.narinfo` string and returns the
/// nixbase32-decoded digest.
pub fn parse_narinfo_str(s: &str) -> Option<[u8; 20]> {
    if !s.is_char_boundary(32) {
        trace!("invalid string, no char boundary at 32");
        return None;
    }

    match s.split_at(32) {
        (hash_str, ".narinfo") => match nixbase32::decode_fixed(hash_str) {
            Err(e) => {
                trace!(err=%e, "invalid nixbase32 encoding");
                None
            }
            Ok(digest) => Some(digest),
        },
        _ => {
            trace!("invalid string, no .narinfo suffix");
            None
        }
    }
}
