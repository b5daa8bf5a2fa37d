//! Building blocks of the [ATerm][] format, which is used to serialize
//! derivations.
//!
//! [ATerm]: http://program-transformation.org/Tools/ATermFormat.html

mod escape;
mod parser;

pub(crate) use escape::escape_bytes;
pub(crate) use parser::{parse_string_field, parse_string_list};
