//! The Nix archive format (NAR), a deterministic serialization of a file
//! system tree.

pub(crate) mod wire;
pub mod writer;
