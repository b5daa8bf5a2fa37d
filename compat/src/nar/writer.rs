//! Streaming NAR encoder.
//!
//! Nodes are emitted depth-first. A directory is opened with
//! [Encoder::open_directory], each child is announced with [Encoder::entry]
//! followed by exactly one node, and the directory is finished with
//! [Encoder::close_directory].
//!
//! ```rust
//! # use ferrix_compat::nar::writer::Encoder;
//! let mut nar = Encoder::new(Vec::new())?;
//! nar.open_directory()?;
//! nar.entry(b"hello")?;
//! nar.file(false, 5, &mut &b"world"[..])?;
//! nar.close_directory()?;
//! let bytes = nar.finish()?;
//! # assert!(!bytes.is_empty());
//! # Ok::<(), std::io::Error>(())
//! ```

use std::io::{self, ErrorKind, Read, Write};

use super::wire;

pub struct Encoder<W: Write> {
    inner: W,
    /// One element per open directory, holding the last entry name written.
    dirs: Vec<Option<Vec<u8>>>,
    root_written: bool,
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, msg)
}

impl<W: Write> Encoder<W> {
    /// Starts a new archive on the given writer.
    pub fn new(mut inner: W) -> io::Result<Self> {
        inner.write_all(&wire::TOK_NAR)?;
        Ok(Self {
            inner,
            dirs: Vec::new(),
            root_written: false,
        })
    }

    fn pad(&mut self, len: u64) -> io::Result<()> {
        match (len & 7) as usize {
            0 => Ok(()),
            n => self.inner.write_all(&[0; 8][n..]),
        }
    }

    fn write_str(&mut self, s: &[u8]) -> io::Result<()> {
        self.inner.write_all(&(s.len() as u64).to_le_bytes())?;
        self.inner.write_all(s)?;
        self.pad(s.len() as u64)
    }

    fn begin_node(&mut self) -> io::Result<()> {
        if self.dirs.is_empty() {
            if self.root_written {
                return Err(invalid("archive already has a root node".into()));
            }
            self.root_written = true;
        }
        Ok(())
    }

    pub fn symlink(&mut self, target: &[u8]) -> io::Result<()> {
        if target.is_empty() || target.len() > wire::MAX_TARGET_LEN || target.contains(&0) {
            return Err(invalid(format!("invalid symlink target: {target:?}")));
        }
        self.begin_node()?;
        self.inner.write_all(&wire::TOK_SYM)?;
        self.write_str(target)?;
        self.inner.write_all(&wire::TOK_PAR)
    }

    /// Writes a regular file of exactly `size` bytes taken from `reader`.
    /// The reader must not hold more data than that.
    pub fn file(&mut self, executable: bool, size: u64, reader: &mut dyn Read) -> io::Result<()> {
        self.begin_node()?;
        self.inner.write_all(if executable {
            &wire::TOK_EXE
        } else {
            &wire::TOK_REG
        })?;
        self.inner.write_all(&size.to_le_bytes())?;

        let copied = io::copy(&mut (&mut *reader).take(size), &mut self.inner)?;
        if copied != size {
            return Err(ErrorKind::UnexpectedEof.into());
        }
        if reader.read(&mut [0u8; 1])? != 0 {
            return Err(invalid(format!("file has more than {size} bytes")));
        }

        self.pad(size)?;
        self.inner.write_all(&wire::TOK_PAR)
    }

    pub fn open_directory(&mut self) -> io::Result<()> {
        self.begin_node()?;
        self.inner.write_all(&wire::TOK_DIR)?;
        self.dirs.push(None);
        Ok(())
    }

    /// Announces the next child of the innermost open directory. Names
    /// must be strictly increasing.
    pub fn entry(&mut self, name: &[u8]) -> io::Result<()> {
        if name.is_empty()
            || name.len() > wire::MAX_NAME_LEN
            || name == b"."
            || name == b".."
            || name.contains(&b'/')
            || name.contains(&0)
        {
            return Err(invalid(format!("invalid entry name: {name:?}")));
        }

        let prev = self
            .dirs
            .last_mut()
            .ok_or_else(|| invalid("entry outside of a directory".into()))?;
        let close_prev = match prev {
            Some(prev) if prev.as_slice() >= name => {
                return Err(invalid(format!("misordered names: {prev:?} >= {name:?}")));
            }
            Some(prev) => {
                prev.clear();
                prev.extend_from_slice(name);
                true
            }
            None => {
                *prev = Some(name.to_vec());
                false
            }
        };

        if close_prev {
            self.inner.write_all(&wire::TOK_PAR)?;
        }
        self.inner.write_all(&wire::TOK_ENT)?;
        self.write_str(name)?;
        self.inner.write_all(&wire::TOK_NOD)
    }

    pub fn close_directory(&mut self) -> io::Result<()> {
        let prev = self
            .dirs
            .pop()
            .ok_or_else(|| invalid("no open directory".into()))?;
        if prev.is_some() {
            self.inner.write_all(&wire::TOK_PAR)?;
        }
        self.inner.write_all(&wire::TOK_PAR)
    }

    /// Checks the archive is complete and hands back the writer.
    pub fn finish(mut self) -> io::Result<W> {
        if !self.dirs.is_empty() {
            return Err(invalid(format!("{} directories left open", self.dirs.len())));
        }
        if !self.root_written {
            return Err(invalid("archive has no root node".into()));
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::{wire, Encoder};
    use crate::nar::wire::token;
    use pretty_assertions::assert_eq;
    use std::io::ErrorKind;

    fn concat(parts: &[&[u8]]) -> Vec<u8> {
        parts.concat()
    }

    #[test]
    fn symlink() {
        let mut nar = Encoder::new(Vec::new()).unwrap();
        nar.symlink(b"/nix/store/somewhereelse").unwrap();
        let bytes = nar.finish().unwrap();

        assert_eq!(
            concat(&[
                &wire::TOK_NAR,
                &token(&["symlink", "target", "/nix/store/somewhereelse", ")"]),
            ]),
            bytes
        );
    }

    #[test]
    fn executable_file() {
        let mut nar = Encoder::new(Vec::new()).unwrap();
        nar.file(true, 12, &mut &b"Hello World!"[..]).unwrap();
        let bytes = nar.finish().unwrap();

        assert_eq!(
            concat(&[
                &wire::TOK_NAR,
                &wire::TOK_EXE,
                &token(&["Hello World!"]),
                &wire::TOK_PAR,
            ]),
            bytes
        );
    }

    #[test]
    fn nested_directories() {
        let mut nar = Encoder::new(Vec::new()).unwrap();
        nar.open_directory().unwrap();
        nar.entry(b"a").unwrap();
        nar.open_directory().unwrap();
        nar.close_directory().unwrap();
        nar.entry(b"b").unwrap();
        nar.symlink(b"a").unwrap();
        nar.close_directory().unwrap();
        let bytes = nar.finish().unwrap();

        assert_eq!(
            concat(&[
                &wire::TOK_NAR,
                &wire::TOK_DIR,
                &wire::TOK_ENT,
                &token(&["a"]),
                &wire::TOK_NOD,
                &wire::TOK_DIR,
                &wire::TOK_PAR,
                &wire::TOK_PAR,
                &wire::TOK_ENT,
                &token(&["b"]),
                &wire::TOK_NOD,
                &wire::TOK_SYM,
                &token(&["a"]),
                &wire::TOK_PAR,
                &wire::TOK_PAR,
                &wire::TOK_PAR,
            ]),
            bytes
        );
    }

    #[test]
    fn misordered_entries() {
        let mut nar = Encoder::new(Vec::new()).unwrap();
        nar.open_directory().unwrap();
        nar.entry(b"b").unwrap();
        nar.symlink(b"x").unwrap();
        let err = nar.entry(b"a").expect_err("must fail");
        assert_eq!(ErrorKind::InvalidInput, err.kind());
    }

    #[test]
    fn file_size_mismatch() {
        let mut nar = Encoder::new(Vec::new()).unwrap();
        let err = nar.file(false, 20, &mut &b"short"[..]).expect_err("must fail");
        assert_eq!(ErrorKind::UnexpectedEof, err.kind());

        let mut nar = Encoder::new(Vec::new()).unwrap();
        let err = nar.file(false, 2, &mut &b"long"[..]).expect_err("must fail");
        assert_eq!(ErrorKind::InvalidInput, err.kind());
    }

    #[test]
    fn unfinished() {
        let mut nar = Encoder::new(Vec::new()).unwrap();
        nar.open_directory().unwrap();
        nar.finish().expect_err("open directory");

        Encoder::new(Vec::new())
            .unwrap()
            .finish()
            .expect_err("no root");
    }
}
