//! This module implements the serialisation of derivations into the
//! [ATerm][] format.
//!
//! [ATerm]: http://program-transformation.org/Tools/ATermFormat.html

use crate::aterm::escape_bytes;
use crate::derivation::output::Output;
use std::collections::{BTreeMap, BTreeSet};

pub const DERIVATION_PREFIX: &str = "Derive";
pub const PAREN_OPEN: char = '(';
pub const PAREN_CLOSE: char = ')';
pub const BRACKET_OPEN: char = '[';
pub const BRACKET_CLOSE: char = ']';
pub const COMMA: char = ',';
pub const QUOTE: char = '"';

/// Appends `s` quoted and escaped.
fn write_field(out: &mut String, s: &str) {
    out.push(QUOTE);
    // escaping only replaces ASCII, the result stays valid UTF-8.
    out.push_str(&String::from_utf8_lossy(&escape_bytes(s)));
    out.push(QUOTE);
}

fn write_array_elements<S: AsRef<str>>(out: &mut String, elements: impl IntoIterator<Item = S>) {
    out.push(BRACKET_OPEN);
    for (index, element) in elements.into_iter().enumerate() {
        if index > 0 {
            out.push(COMMA);
        }
        write_field(out, element.as_ref());
    }
    out.push(BRACKET_CLOSE);
}

pub(crate) fn write_outputs(out: &mut String, outputs: &BTreeMap<String, Output>) {
    out.push(BRACKET_OPEN);
    for (ii, (output_name, output)) in outputs.iter().enumerate() {
        if ii > 0 {
            out.push(COMMA);
        }

        let (hash_algo, hash) = output.hash_fields();

        out.push(PAREN_OPEN);
        write_field(out, output_name);
        out.push(COMMA);
        write_field(out, &output.path_str());
        out.push(COMMA);
        write_field(out, &hash_algo);
        out.push(COMMA);
        write_field(out, &hash);
        out.push(PAREN_CLOSE);
    }
    out.push(BRACKET_CLOSE);
}

/// Input derivations are passed with string keys, so hash-modulo
/// calculation can put hex digests in place of the paths.
pub(crate) fn write_input_derivations(
    out: &mut String,
    input_derivations: &BTreeMap<String, BTreeSet<String>>,
) {
    out.push(BRACKET_OPEN);
    for (ii, (input_derivation_path, output_names)) in input_derivations.iter().enumerate() {
        if ii > 0 {
            out.push(COMMA);
        }

        out.push(PAREN_OPEN);
        write_field(out, input_derivation_path);
        out.push(COMMA);
        write_array_elements(out, output_names);
        out.push(PAREN_CLOSE);
    }
    out.push(BRACKET_CLOSE);
}

pub(crate) fn write_input_sources(out: &mut String, input_sources: &BTreeSet<String>) {
    write_array_elements(out, input_sources);
}

pub(crate) fn write_system(out: &mut String, platform: &str) {
    write_field(out, platform);
}

pub(crate) fn write_builder(out: &mut String, builder: &str) {
    write_field(out, builder);
}

pub(crate) fn write_arguments(out: &mut String, arguments: &[String]) {
    write_array_elements(out, arguments);
}

pub(crate) fn write_environment(out: &mut String, environment: &BTreeMap<String, String>) {
    out.push(BRACKET_OPEN);
    for (i, (k, v)) in environment.iter().enumerate() {
        if i > 0 {
            out.push(COMMA);
        }
        out.push(PAREN_OPEN);
        write_field(out, k);
        out.push(COMMA);
        write_field(out, v);
        out.push(PAREN_CLOSE);
    }
    out.push(BRACKET_CLOSE);
}
