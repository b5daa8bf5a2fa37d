//! NAR wire tokens.
//!
//! Lengths are 64-bit little-endian integers. Strings (file contents and
//! the syntactic keywords alike) are length-prefixed and zero padded to a
//! multiple of 8 bytes.
//!
//! ```plain
//! archive ::= "nix-archive-1" node
//!
//! node ::= "(" "type" "symlink" "target" string ")"
//!      ||= "(" "type" "regular" ("executable" "")? "contents" string ")"
//!      ||= "(" "type" "directory" entry* ")"
//!
//! entry ::= "entry" "(" "name" string "node" node ")"
//! ```
//!
//! The constants below are the fixed keyword runs of that grammar, already
//! encoded.

/// Maximum length of a directory entry name
pub const MAX_NAME_LEN: usize = 255;
/// Maximum length of a symlink target
pub const MAX_TARGET_LEN: usize = 4095;

/// `"nix-archive-1" "(" "type"`
pub const TOK_NAR: [u8; 56] = *b"\x0d\0\0\0\0\0\0\0nix-archive-1\0\0\0\x01\0\0\0\0\0\0\0(\0\0\0\0\0\0\0\x04\0\0\0\0\0\0\0type\0\0\0\0";
/// `"symlink" "target"`
pub const TOK_SYM: [u8; 32] = *b"\x07\0\0\0\0\0\0\0symlink\0\x06\0\0\0\0\0\0\0target\0\0";
/// `"regular" "contents"`
pub const TOK_REG: [u8; 32] = *b"\x07\0\0\0\0\0\0\0regular\0\x08\0\0\0\0\0\0\0contents";
/// `"regular" "executable" "" "contents"`
pub const TOK_EXE: [u8; 64] = *b"\x07\0\0\0\0\0\0\0regular\0\x0a\0\0\0\0\0\0\0executable\0\0\0\0\0\0\0\0\0\0\0\0\0\0\x08\0\0\0\0\0\0\0contents";
/// `"directory"`
pub const TOK_DIR: [u8; 24] = *b"\x09\0\0\0\0\0\0\0directory\0\0\0\0\0\0\0";
/// `"entry" "(" "name"`
pub const TOK_ENT: [u8; 48] = *b"\x05\0\0\0\0\0\0\0entry\0\0\0\x01\0\0\0\0\0\0\0(\0\0\0\0\0\0\0\x04\0\0\0\0\0\0\0name\0\0\0\0";
/// `"node" "(" "type"`
pub const TOK_NOD: [u8; 48] = *b"\x04\0\0\0\0\0\0\0node\0\0\0\0\x01\0\0\0\0\0\0\0(\0\0\0\0\0\0\0\x04\0\0\0\0\0\0\0type\0\0\0\0";
/// `")"`
pub const TOK_PAR: [u8; 16] = *b"\x01\0\0\0\0\0\0\0)\0\0\0\0\0\0\0";

/// Encodes a sequence of strings the way they appear on the wire.
#[cfg(test)]
pub(crate) fn token(xs: &[&str]) -> Vec<u8> {
    let mut out = vec![];
    for x in xs {
        out.extend_from_slice(&(x.len() as u64).to_le_bytes());
        out.extend_from_slice(x.as_bytes());

        let n = x.len() & 7;
        if n != 0 {
            out.extend_from_slice(&[0; 8][n..]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::nar(&TOK_NAR, &["nix-archive-1", "(", "type"])]
    #[case::sym(&TOK_SYM, &["symlink", "target"])]
    #[case::reg(&TOK_REG, &["regular", "contents"])]
    #[case::exe(&TOK_EXE, &["regular", "executable", "", "contents"])]
    #[case::dir(&TOK_DIR, &["directory"])]
    #[case::ent(&TOK_ENT, &["entry", "(", "name"])]
    #[case::nod(&TOK_NOD, &["node", "(", "type"])]
    #[case::par(&TOK_PAR, &[")"])]
    fn tokens(#[case] tok: &[u8], #[case] xs: &[&str]) {
        assert_eq!(tok, token(xs));
    }
}
