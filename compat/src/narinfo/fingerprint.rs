use crate::{nixbase32, store_path::StorePath};

/// Computes the fingerprint string signed by binary cache keys:
/// `1;$path;sha256:$nixbase32;$size;$refs`, with references as absolute
/// paths joined by `,`.
pub fn fingerprint<'a, R: Iterator<Item = &'a StorePath>>(
    store_path: &StorePath,
    nar_sha256: &[u8; 32],
    nar_size: u64,
    references: R,
) -> String {
    format!(
        "1;{};sha256:{};{};{}",
        store_path.to_absolute_path(),
        nixbase32::encode(nar_sha256),
        nar_size,
        references
            .map(StorePath::to_absolute_path)
            .collect::<Vec<String>>()
            .join(",")
    )
}
