//! fs.rs — Filesystem seam for ESP mutations
//!
//! Everything the kernel manager does to disk goes through [`Filesystem`] so
//! runs can be replayed against an in-memory tree with injected faults.
//! Writes are always whole-file replacements via a temporary sibling and a
//! rename: an interrupted run leaves either the old or the new file, never a
//! torn kernel image or fallback config.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

pub trait Filesystem {
    /// File names (not paths) in `dir`, sorted.
    fn read_dir(&self, dir: &Path) -> io::Result<Vec<String>>;

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + '_>>;

    /// Replace `path` with the bytes read from `contents`, atomically.
    fn write_atomic(&self, path: &Path, contents: &mut dyn Read) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    fn exists(&self, path: &Path) -> bool;
}

/// The host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFs;

impl Filesystem for OsFs {
    fn read_dir(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(File::open(path)?))
    }

    fn write_atomic(&self, path: &Path, contents: &mut dyn Read) -> io::Result<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        io::copy(contents, tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        // best effort: FAT has no directory fsync semantics worth failing over
        if let Ok(d) = File::open(dir) {
            let _ = d.sync_all();
        }
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[derive(Debug, Default)]
struct MemTree {
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, Vec<u8>>,
    fail_remove: BTreeSet<PathBuf>,
    fail_write: BTreeSet<PathBuf>,
}

/// In-memory filesystem for tests. Each test builds its own.
#[derive(Debug, Default)]
pub struct MemFs {
    tree: RefCell<MemTree>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `path` and all of its ancestors.
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let mut tree = self.tree.borrow_mut();
        for p in path.as_ref().ancestors() {
            if !p.as_os_str().is_empty() {
                tree.dirs.insert(p.to_path_buf());
            }
        }
    }

    pub fn add_file(&self, path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            self.add_dir(parent);
        }
        self.tree
            .borrow_mut()
            .files
            .insert(path.to_path_buf(), contents.into());
    }

    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.tree.borrow().files.get(path.as_ref()).cloned()
    }

    /// Make every later `remove_file(path)` fail.
    pub fn fail_remove(&self, path: impl AsRef<Path>) {
        self.tree
            .borrow_mut()
            .fail_remove
            .insert(path.as_ref().to_path_buf());
    }

    /// Make every later `write_atomic(path, _)` fail.
    pub fn fail_write(&self, path: impl AsRef<Path>) {
        self.tree
            .borrow_mut()
            .fail_write
            .insert(path.as_ref().to_path_buf());
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{}: no such file or directory", path.display()),
    )
}

impl Filesystem for MemFs {
    fn read_dir(&self, dir: &Path) -> io::Result<Vec<String>> {
        let tree = self.tree.borrow();
        if !tree.dirs.contains(dir) {
            return Err(not_found(dir));
        }
        let files = tree.files.keys();
        let dirs = tree.dirs.iter();
        let mut names: Vec<String> = files
            .chain(dirs)
            .filter(|p| p.parent() == Some(dir))
            .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + '_>> {
        let data = self
            .tree
            .borrow()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn write_atomic(&self, path: &Path, contents: &mut dyn Read) -> io::Result<()> {
        {
            let tree = self.tree.borrow();
            if tree.fail_write.contains(path) {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{}: simulated write failure", path.display()),
                ));
            }
            let parent = path.parent().ok_or_else(|| not_found(path))?;
            if !tree.dirs.contains(parent) {
                return Err(not_found(parent));
            }
        }
        let mut data = Vec::new();
        contents.read_to_end(&mut data)?;
        self.tree.borrow_mut().files.insert(path.to_path_buf(), data);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let mut tree = self.tree.borrow_mut();
        if tree.fail_remove.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{}: simulated removal failure", path.display()),
            ));
        }
        tree.files.remove(path).map(|_| ()).ok_or_else(|| not_found(path))
    }

    fn exists(&self, path: &Path) -> bool {
        let tree = self.tree.borrow();
        tree.files.contains_key(path) || tree.dirs.contains(path)
    }
}

/// SHA-256 of a file's contents, streamed.
pub fn hash_file(fs: &dyn Filesystem, path: &Path) -> io::Result<[u8; 32]> {
    let mut file = fs.open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Copy `source` over `target` unless they already hold the same bytes.
///
/// Returns whether `target` was written. A missing target counts as changed.
pub fn maybe_update_file(fs: &dyn Filesystem, target: &Path, source: &Path) -> io::Result<bool> {
    let wanted = hash_file(fs, source)?;
    match hash_file(fs, target) {
        Ok(current) if current == wanted => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let mut reader = fs.open(source)?;
    fs.write_atomic(target, &mut reader)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn copies_when_target_missing_then_settles() {
        let fs = MemFs::new();
        fs.add_file("/src/a", b"one".to_vec());
        fs.add_dir("/dst");

        assert!(maybe_update_file(&fs, Path::new("/dst/a"), Path::new("/src/a")).unwrap());
        assert_eq!(fs.contents("/dst/a").unwrap(), b"one".to_vec());
        assert!(!maybe_update_file(&fs, Path::new("/dst/a"), Path::new("/src/a")).unwrap());
    }

    #[test]
    fn replaces_changed_target() {
        let fs = MemFs::new();
        fs.add_file("/src/a", b"new".to_vec());
        fs.add_file("/dst/a", b"old".to_vec());

        assert!(maybe_update_file(&fs, Path::new("/dst/a"), Path::new("/src/a")).unwrap());
        assert_eq!(fs.contents("/dst/a").unwrap(), b"new".to_vec());
    }

    #[test]
    fn missing_source_is_an_error() {
        let fs = MemFs::new();
        fs.add_dir("/dst");
        let err = maybe_update_file(&fs, Path::new("/dst/a"), Path::new("/src/a")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn mem_read_dir_lists_direct_children() {
        let fs = MemFs::new();
        fs.add_file("/d/b", Vec::new());
        fs.add_file("/d/a", Vec::new());
        fs.add_file("/d/sub/c", Vec::new());

        assert_eq!(fs.read_dir(Path::new("/d")).unwrap(), vec!["a", "b", "sub"]);
        assert_eq!(
            fs.read_dir(Path::new("/nope")).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn injected_faults() {
        let fs = MemFs::new();
        fs.add_file("/d/a", b"x".to_vec());
        fs.fail_remove("/d/a");
        fs.fail_write("/d/b");

        assert!(fs.remove_file(Path::new("/d/a")).is_err());
        assert!(fs.exists(Path::new("/d/a")));
        assert!(fs.write_atomic(Path::new("/d/b"), &mut &b"y"[..]).is_err());
        assert!(!fs.exists(Path::new("/d/b")));
    }

    #[test]
    fn os_write_atomic_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"old").unwrap();

        OsFs.write_atomic(&path, &mut &b"new contents"[..]).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"new contents".to_vec());
        assert_eq!(OsFs.read_dir(dir.path()).unwrap(), vec!["f"]);
    }
}
