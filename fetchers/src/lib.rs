//! Fetching source trees into a store.
//!
//! An [Input] is a bag of [Attrs] bound to the [InputScheme] of its `type`,
//! looked up in a [Registry]. Fetching goes through a [FetchContext]
//! carrying the target store, the fetch cache and the [FetchSettings].

pub mod attrs;
pub mod cache;
mod context;
mod decompression;
pub mod download;
mod errors;
pub mod git_utils;
mod input;
pub mod lock;
pub mod run;
pub mod schemes;
mod settings;
pub mod source_ref;

pub use attrs::{Attr, Attrs};
pub use context::{FetchContext, FETCH_CACHE_FILE};
pub use errors::{Error, ErrorKind, Outcome};
pub use input::{Input, InputScheme, Registry, Tree};
pub use settings::FetchSettings;
pub use source_ref::SourceRef;
