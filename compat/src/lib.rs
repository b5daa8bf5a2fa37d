//! Data formats of the store: hashes, store paths, derived paths,
//! derivations, narinfo files and `nix.conf`.

pub(crate) mod aterm;
pub mod derivation;
pub mod derived_path;
pub mod nar;
pub mod narinfo;
pub mod nix_http;
pub mod nixbase32;
pub mod nixcpp;
pub mod nixhash;
pub mod path_info;
pub mod store_path;
