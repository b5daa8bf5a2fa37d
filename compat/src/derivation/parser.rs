//! This module constructs a [Derivation] by parsing its [ATerm][]
//! serialization.
//!
//! [ATerm]: http://program-transformation.org/Tools/ATermFormat.html

use nom::bytes::complete::tag;
use nom::character::complete::char as nomchar;
use nom::combinator::all_consuming;
use nom::multi::{separated_list0, separated_list1};
use nom::sequence::{delimited, preceded, separated_pair, terminated, tuple};
use std::collections::{BTreeMap, BTreeSet};

use super::parse_error::{into_nomerror, ErrorKind, NomError, NomResult};
use super::{write, Derivation, Output};
use crate::aterm;
use crate::store_path::StorePath;

#[derive(Debug, thiserror::Error)]
pub enum Error<I> {
    #[error("parsing error: {0:?}")]
    Parser(NomError<I>),
    #[error("premature EOF")]
    Incomplete,
    #[error("validation error: {0}")]
    Validation(super::DerivationError),
}

pub(crate) fn parse(i: &[u8]) -> Result<Derivation, Error<&[u8]>> {
    match all_consuming(parse_derivation)(i) {
        Ok((rest, derivation)) => {
            debug_assert!(rest.is_empty());

            derivation.validate(true).map_err(Error::Validation)?;

            Ok(derivation)
        }
        Err(nom::Err::Incomplete(_)) => Err(Error::Incomplete),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(Error::Parser(e)),
    }
}

fn failure<I, O>(input: I, code: ErrorKind) -> NomResult<I, O> {
    Err(nom::Err::Failure(NomError { input, code }))
}

fn to_store_path<'a>(i: &'a [u8], s: &str) -> Result<StorePath, nom::Err<NomError<&'a [u8]>>> {
    StorePath::from_absolute_path(s.as_bytes()).map_err(|_| {
        nom::Err::Failure(NomError {
            input: i,
            code: ErrorKind::InvalidStorePath(s.to_string()),
        })
    })
}

/// Parse one output in ATerm. This is 4 string fields inside parens:
/// output name, output path, algo (and mode), digest.
fn parse_output(i: &[u8]) -> NomResult<&[u8], (String, Output)> {
    let (rest, (output_name, path, hash_algo, hash)) = delimited(
        nomchar('('),
        tuple((
            terminated(aterm::parse_string_field, nomchar(',')),
            terminated(aterm::parse_string_field, nomchar(',')),
            terminated(aterm::parse_string_field, nomchar(',')),
            aterm::parse_string_field,
        )),
        nomchar(')'),
    )(i)
    .map_err(into_nomerror)?;

    match Output::from_fields(&path, &hash_algo, &hash) {
        Ok(output) => Ok((rest, (output_name, output))),
        Err(e) => failure(i, ErrorKind::InvalidOutput(output_name, e)),
    }
}

/// Parse multiple outputs in ATerm. These are 4-tuples, so [parse_kv]
/// doesn't apply.
fn parse_outputs(i: &[u8]) -> NomResult<&[u8], BTreeMap<String, Output>> {
    let (rest, outputs_lst) = delimited(
        nomchar('['),
        separated_list1(tag(","), parse_output),
        nomchar(']'),
    )(i)?;

    let mut outputs: BTreeMap<String, Output> = BTreeMap::default();
    for (output_name, output) in outputs_lst.into_iter() {
        if outputs.contains_key(&output_name) {
            return failure(i, ErrorKind::DuplicateMapKey(output_name));
        }
        outputs.insert(output_name, output);
    }
    Ok((rest, outputs))
}

fn parse_input_derivations(i: &[u8]) -> NomResult<&[u8], BTreeMap<StorePath, BTreeSet<String>>> {
    let (rest, input_derivations_list) = parse_kv::<Vec<String>, _>(aterm::parse_string_list)(i)?;

    let mut input_derivations: BTreeMap<StorePath, BTreeSet<String>> = BTreeMap::new();

    for (input_derivation, output_names) in input_derivations_list {
        let mut new_output_names = BTreeSet::new();
        for output_name in output_names.into_iter() {
            if new_output_names.contains(&output_name) {
                return failure(
                    i,
                    ErrorKind::DuplicateInputDerivationOutputName(input_derivation, output_name),
                );
            }
            new_output_names.insert(output_name);
        }
        input_derivations.insert(to_store_path(i, &input_derivation)?, new_output_names);
    }

    Ok((rest, input_derivations))
}

fn parse_input_sources(i: &[u8]) -> NomResult<&[u8], BTreeSet<StorePath>> {
    let (rest, input_sources_lst) = aterm::parse_string_list(i).map_err(into_nomerror)?;

    let mut input_sources: BTreeSet<_> = BTreeSet::new();
    for input_source in input_sources_lst.into_iter() {
        if !input_sources.insert(to_store_path(i, &input_source)?) {
            return failure(i, ErrorKind::DuplicateInputSource(input_source));
        }
    }

    Ok((rest, input_sources))
}

pub fn parse_derivation(i: &[u8]) -> NomResult<&[u8], Derivation> {
    use nom::Parser;
    preceded(
        tag(write::DERIVATION_PREFIX),
        delimited(
            nomchar('('),
            // tuple requires all errors to be of the same type, so the
            // generic IResults get wrapped into [NomResult].
            tuple((
                terminated(parse_outputs, nomchar(',')),
                terminated(parse_input_derivations, nomchar(',')),
                terminated(parse_input_sources, nomchar(',')),
                // system
                |i| terminated(aterm::parse_string_field, nomchar(','))(i).map_err(into_nomerror),
                // builder
                |i| terminated(aterm::parse_string_field, nomchar(','))(i).map_err(into_nomerror),
                // arguments
                |i| terminated(aterm::parse_string_list, nomchar(','))(i).map_err(into_nomerror),
                parse_kv::<String, _>(aterm::parse_string_field),
            )),
            nomchar(')'),
        )
        .map(
            |(
                outputs,
                input_derivations,
                input_sources,
                system,
                builder,
                arguments,
                environment,
            )| {
                Derivation {
                    arguments,
                    builder,
                    environment,
                    input_derivations,
                    input_sources,
                    outputs,
                    system,
                }
            },
        ),
    )(i)
}

/// Parse a list of key/value pairs into a BTreeMap.
/// The parser for the values can be passed in.
/// In terms of ATerm, this is just a 2-tuple,
/// but we have the additional restriction that the first element needs to be
/// unique across all tuples.
pub(crate) fn parse_kv<'a, V, VF>(
    vf: VF,
) -> impl FnMut(&'a [u8]) -> NomResult<&'a [u8], BTreeMap<String, V>> + 'static
where
    VF: FnMut(&'a [u8]) -> nom::IResult<&'a [u8], V, nom::error::Error<&'a [u8]>> + Clone + 'static,
{
    move |i| {
        let (rest, pairs) = delimited(
            nomchar('['),
            separated_list0(
                nomchar(','),
                delimited(
                    nomchar('('),
                    separated_pair(aterm::parse_string_field, nomchar(','), vf.clone()),
                    nomchar(')'),
                ),
            ),
            nomchar(']'),
        )(i)
        .map_err(into_nomerror)?;

        let mut kvs: BTreeMap<String, V> = BTreeMap::new();
        for (k, v) in pairs.into_iter() {
            if kvs.contains_key(&k) {
                return failure(i, ErrorKind::DuplicateMapKey(k));
            }
            kvs.insert(k, v);
        }
        Ok((rest, kvs))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::parse_kv;
    use crate::aterm;
    use crate::derivation::parse_error::ErrorKind;
    use crate::derivation::{Derivation, Output};
    use crate::nixhash::{CAHash, NixHash};
    use crate::store_path::StorePath;
    use hex_literal::hex;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case::empty(b"[]", BTreeMap::new(), b"")]
    #[case::simple(br#"[("a","1"),("b","2")]"#, BTreeMap::from([("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]), b"")]
    #[case::with_rest(br#"[("a","1")]rest"#, BTreeMap::from([("a".to_string(), "1".to_string())]), b"rest")]
    fn parse_kv_strings(
        #[case] input: &'static [u8],
        #[case] expected: BTreeMap<String, String>,
        #[case] exp_rest: &[u8],
    ) {
        let (rest, parsed) =
            parse_kv::<String, _>(aterm::parse_string_field)(input).expect("must parse");
        assert_eq!(exp_rest, rest, "expected remainder");
        assert_eq!(expected, parsed);
    }

    #[test]
    fn parse_kv_duplicate_key() {
        let input: &'static [u8] = br#"[("a","1"),("a","2")]"#;
        let err = parse_kv::<String, _>(aterm::parse_string_field)(input).expect_err("must fail");
        match err {
            nom::Err::Failure(e) => {
                assert_eq!(ErrorKind::DuplicateMapKey("a".to_string()), e.code)
            }
            _ => panic!("unexpected error kind"),
        }
    }

    #[test]
    fn parse_fixed_output() {
        let input = br#"("out","/nix/store/4q0pg5zpfmznxscq3avycvf9xdvx50n3-bar","r:sha256","08813cbee9903c62be4c5027726a418a300da4500b2d369d3af9286f4815ceba")"#;
        let (rest, (name, output)) = super::parse_output(input).expect("must parse");
        assert!(rest.is_empty());
        assert_eq!("out", name);
        assert_eq!(
            Output::Fixed {
                path: Some(
                    StorePath::from_absolute_path(
                        b"/nix/store/4q0pg5zpfmznxscq3avycvf9xdvx50n3-bar"
                    )
                    .unwrap()
                ),
                hash: CAHash::Nar(NixHash::Sha256(hex!(
                    "08813cbee9903c62be4c5027726a418a300da4500b2d369d3af9286f4815ceba"
                ))),
            },
            output
        );
    }

    #[rstest]
    #[case::no_outputs(br#"Derive([],[],[],"x86_64-linux","/bin/sh",[],[])"#)]
    #[case::duplicate_outputs(br#"Derive([("out","","",""),("out","","","")],[],[],"x86_64-linux","/bin/sh",[],[])"#)]
    #[case::bad_input_source(br#"Derive([("out","","r:sha256","")],[],["/tmp/foo"],"x86_64-linux","/bin/sh",[],[])"#)]
    #[case::trailing_garbage(br#"Derive([("out","","r:sha256","")],[],[],"x86_64-linux","/bin/sh",[],[])x"#)]
    #[case::truncated(br#"Derive([("out","","r:sha256","")],[],[],"x86_64-linux""#)]
    fn parse_fail(#[case] input: &[u8]) {
        Derivation::from_aterm_bytes(input).expect_err("must fail");
    }
}
