//! NAR serialisation of trees on the local filesystem.

use std::{
    fs::{self, File},
    io::{self, Write},
    os::unix::{ffi::OsStrExt, fs::PermissionsExt},
    path::Path,
};

use count_write::CountWrite;
use ferrix_compat::nar::writer::Encoder;
use sha2::{Digest, Sha256};

/// Decides whether a path below the root being serialised is included.
/// It's called with the full path of every entry, never with the root.
pub type PathFilter = dyn Fn(&Path) -> bool + Send + Sync;

/// Writes the NAR serialisation of `path` to `sink`, returning the sink.
pub fn dump_path<W: Write>(path: &Path, sink: W, filter: Option<&PathFilter>) -> io::Result<W> {
    let mut nar = Encoder::new(sink)?;
    dump_node(&mut nar, path, filter)?;
    nar.finish()
}

fn dump_node<W: Write>(
    nar: &mut Encoder<W>,
    path: &Path,
    filter: Option<&PathFilter>,
) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    let file_type = metadata.file_type();

    if file_type.is_symlink() {
        let target = fs::read_link(path)?;
        nar.symlink(target.as_os_str().as_bytes())
    } else if file_type.is_file() {
        let executable = metadata.permissions().mode() & 0o100 != 0;
        let mut file = File::open(path)?;
        nar.file(executable, metadata.len(), &mut file)
    } else if file_type.is_dir() {
        let mut names = fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.file_name()))
            .collect::<io::Result<Vec<_>>>()?;
        names.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

        nar.open_directory()?;
        for name in names {
            let child = path.join(&name);
            if filter.map_or(true, |f| f(&child)) {
                nar.entry(name.as_bytes())?;
                dump_node(nar, &child, filter)?;
            }
        }
        nar.close_directory()
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported file type at {}", path.display()),
        ))
    }
}

/// Returns the sha256 digest and size of the NAR serialisation of `path`.
pub fn nar_hash_path(path: &Path, filter: Option<&PathFilter>) -> io::Result<([u8; 32], u64)> {
    let cw = dump_path(path, CountWrite::from(Sha256::new()), filter)?;
    let size = cw.count();
    Ok((cw.into_inner().finalize().into(), size))
}
