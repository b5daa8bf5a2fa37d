//! Git reference names and `ls-remote` output.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Names usable as a `ref` in URL paths.
    pub static ref REF_REGEX: Regex = Regex::new(r"^[a-zA-Z0-9@][a-zA-Z0-9_./@+-]*$").unwrap();

    /// A full sha1 commit hash.
    pub static ref REV_REGEX: Regex = Regex::new(r"^[0-9a-fA-F]{40}$").unwrap();

    /// Matches anything `git check-ref-format` would reject.
    pub static ref BAD_GIT_REF_REGEX: Regex = Regex::new(
        r"//|^[./]|/\.|\.\.|[[:cntrl:][:space:]:?^~\[]|\\|\*|\.lock$|\.lock/|@\{|[/.]$|^@$|^$"
    )
    .unwrap();

    /// A hostname, optionally with a port.
    pub static ref HOST_REGEX: Regex = Regex::new(r"^[a-zA-Z0-9.-]*(:[0-9]+)?$").unwrap();

    static ref LS_REMOTE_LINE: Regex = Regex::new(r"^(ref: *)?([^\s]+)(?:\t+(.*))?$").unwrap();
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefKind {
    /// `ref: refs/heads/main	HEAD`
    Symbolic,
    /// `<sha1>	refs/heads/main`
    Object,
}

/// One line of `git ls-remote --symref` output (or a `HEAD` file).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LsRemoteLine {
    pub kind: RefKind,
    /// The ref pointed at, or the object hash.
    pub target: String,
    /// The ref this line is about, missing in bare `HEAD` files.
    pub reference: Option<String>,
}

pub fn parse_ls_remote_line(line: &str) -> Option<LsRemoteLine> {
    let captures = LS_REMOTE_LINE.captures(line)?;
    Some(LsRemoteLine {
        kind: if captures.get(1).is_some() {
            RefKind::Symbolic
        } else {
            RefKind::Object
        },
        target: captures[2].to_string(),
        reference: captures
            .get(3)
            .map(|m| m.as_str().to_string())
            .filter(|s| !s.is_empty()),
    })
}

pub fn is_bad_git_ref(name: &str) -> bool {
    BAD_GIT_REF_REGEX.is_match(name)
}
