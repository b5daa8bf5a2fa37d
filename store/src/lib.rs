//! Content-addressed stores: the [Store] interface the fetchers ingest
//! into, a directory-backed [LocalStore], binary caches and the signature
//! fan-out helpers operating on many paths at once.

pub mod binary_cache;
pub mod disk_cache;
mod errors;
pub mod local;
pub mod nar;
mod path_info;
pub mod sigs;
mod store;
pub(crate) mod utils;

pub use errors::Error;
pub use local::LocalStore;
pub use path_info::PathInfo;
pub use store::Store;
