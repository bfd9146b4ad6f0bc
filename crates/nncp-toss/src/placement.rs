//! Collision-free, atomic placement of delivered files.
//!
//! Content is written to a hidden temp file in the destination directory and
//! synced. It then appears under the first free name of `dst`, `dst0`,
//! `dst1`, ... in a single step, so no partially written file is ever
//! visible under a final name and an existing file is never overwritten.
//! File delivery and chunk reassembly both go through here.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Give up after this many taken names.
const MAX_SUFFIX: u64 = 1 << 20;

/// `dst` with a numeric suffix appended to its file name.
pub fn candidate(dst: &Path, n: Option<u64>) -> PathBuf {
    match n {
        None => dst.to_path_buf(),
        Some(n) => {
            let mut name = dst.as_os_str().to_owned();
            name.push(n.to_string());
            PathBuf::from(name)
        }
    }
}

/// A synced temp file next to its destination.
pub struct TempFile {
    path: PathBuf,
    file: Option<File>,
    placed: bool,
}

impl TempFile {
    /// Create a hidden temp file in `dir`.
    pub fn create_in(dir: &Path) -> io::Result<Self> {
        loop {
            let path = dir.join(format!(".nncp-{}.tmp", hex::encode(rand::random::<[u8; 8]>())));
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    return Ok(Self {
                        path,
                        file: Some(file),
                        placed: false,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and fsync the content, then move it to the first free name
    /// derived from `dst`. Returns the final path.
    pub fn persist(mut self, dst: &Path) -> io::Result<PathBuf> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        let placed = place(&self.path, dst)?;
        self.placed = true;
        Ok(placed)
    }
}

impl Write for TempFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(f) => f.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "temp file already persisted")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.placed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Link `tmp` under the first free candidate of `dst` and drop the temp
/// name. Hard links fail on an existing name, which makes the free-name
/// search race-free; filesystems without hard links fall back to rename.
pub fn place(tmp: &Path, dst: &Path) -> io::Result<PathBuf> {
    let mut n = None;
    loop {
        let target = candidate(dst, n);
        match fs::hard_link(tmp, &target) {
            Ok(()) => {
                fs::remove_file(tmp)?;
                return Ok(target);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) if is_link_unsupported(&e) => {
                if !target.exists() {
                    fs::rename(tmp, &target)?;
                    return Ok(target);
                }
            }
            Err(e) => return Err(e),
        }
        n = Some(n.map_or(0, |n| n + 1));
        if n > Some(MAX_SUFFIX) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("no free name for {}", dst.display()),
            ));
        }
    }
}

fn is_link_unsupported(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::Unsupported {
        return true;
    }
    #[cfg(unix)]
    {
        matches!(e.raw_os_error(), Some(code) if code == libc::EPERM || code == libc::EXDEV || code == libc::ENOTSUP)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Write everything from `reader` to the first free name of `dst`.
/// Parent directories are created. Returns the final path and byte count.
pub fn write_new<R: Read>(dst: &Path, mut reader: R) -> io::Result<(PathBuf, u64)> {
    let dir = dst
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent"))?;
    fs::create_dir_all(dir)?;
    let mut tmp = TempFile::create_in(dir)?;
    let size = io::copy(&mut reader, &mut tmp)?;
    tmp.flush()?;
    Ok((tmp.persist(dst)?, size))
}
