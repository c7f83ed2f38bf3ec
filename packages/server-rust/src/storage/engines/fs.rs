//! Filesystem [`BlobStore`] implementation.
//!
//! Keys map to relative paths under a root directory. Blobs are written in place
//! through a buffered file and synced on seal. Objects are written to a temporary
//! file in the destination directory and renamed over the target, so a reader
//! never sees a half-written catalog entry.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::storage::engine::{BlobStore, BlobWriter};

/// Blob store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the root directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> PathBuf {
        key.split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }

    fn ensure_parent(path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) => fs::create_dir_all(parent),
            None => Ok(()),
        }
    }
}

/// Collects the keys of all regular files below `dir`. Hidden entries (temporary
/// files in flight) are skipped.
fn walk(dir: &Path, key_prefix: &str, out: &mut Vec<String>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with('.') {
            continue;
        }
        let key = format!("{key_prefix}/{name}");
        if entry.file_type()?.is_dir() {
            walk(&entry.path(), &key, out)?;
        } else {
            out.push(key);
        }
    }
    Ok(())
}

struct FsBlobWriter {
    file: BufWriter<File>,
    written: u64,
}

impl Write for FsBlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl BlobWriter for FsBlobWriter {
    fn seal(self: Box<Self>) -> io::Result<u64> {
        let written = self.written;
        let file = self.file.into_inner().map_err(io::IntoInnerError::into_error)?;
        file.sync_all()?;
        Ok(written)
    }
}

impl BlobStore for FsBlobStore {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn create_blob(&self, key: &str) -> io::Result<Box<dyn BlobWriter>> {
        let path = self.path_of(key);
        Self::ensure_parent(&path)?;
        let file = File::create(&path)?;
        Ok(Box::new(FsBlobWriter {
            file: BufWriter::new(file),
            written: 0,
        }))
    }

    fn open_blob(&self, key: &str) -> io::Result<Box<dyn Read + Send>> {
        let file = File::open(self.path_of(key))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn put_object(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.path_of(key);
        Self::ensure_parent(&path)?;
        let dir = path.parent().unwrap_or(&self.root);

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn get_object(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_of(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let mut keys = Vec::new();
        walk(&self.path_of(prefix), prefix, &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, key: &str) -> io::Result<bool> {
        match fs::remove_file(self.path_of(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn delete_prefix(&self, prefix: &str) -> io::Result<usize> {
        let removed = self.list(prefix)?.len();
        match fs::remove_dir_all(self.path_of(prefix)) {
            Ok(()) => Ok(removed),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    #[test]
    fn blob_round_trip_on_disk() {
        let (_dir, store) = store();
        let mut writer = store.create_blob("sessions/rp1/s1/0/0").unwrap();
        writer.write_all(b"Just a small random backup content").unwrap();
        assert_eq!(writer.seal().unwrap(), 34);

        assert!(store.root().join("sessions/rp1/s1/0/0").is_file());

        let mut out = Vec::new();
        store
            .open_blob("sessions/rp1/s1/0/0")
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"Just a small random backup content");
    }

    #[test]
    fn object_replace_is_whole() {
        let (_dir, store) = store();
        store.put_object("catalog/rp1.pit", b"first").unwrap();
        store.put_object("catalog/rp1.pit", b"second").unwrap();
        assert_eq!(
            store.get_object("catalog/rp1.pit").unwrap(),
            Some(b"second".to_vec())
        );
        assert_eq!(store.list("catalog").unwrap(), vec!["catalog/rp1.pit"]);
    }

    #[test]
    fn list_and_delete_prefix() {
        let (_dir, store) = store();
        for key in ["sessions/a/s/0/0", "sessions/a/s/0/1", "sessions/b/t/0/0"] {
            store.create_blob(key).unwrap().seal().unwrap();
        }

        assert_eq!(store.list("sessions/a").unwrap().len(), 2);
        assert_eq!(store.delete_prefix("sessions/a").unwrap(), 2);
        assert_eq!(store.list("sessions").unwrap(), vec!["sessions/b/t/0/0"]);
        assert_eq!(store.delete_prefix("sessions/missing").unwrap(), 0);
    }

    #[test]
    fn absent_keys() {
        let (_dir, store) = store();
        assert_eq!(store.get_object("catalog/none.pit").unwrap(), None);
        assert!(!store.delete("catalog/none.pit").unwrap());
        assert!(store.list("catalog").unwrap().is_empty());
        assert_eq!(
            store.open_blob("x").err().map(|e| e.kind()),
            Some(io::ErrorKind::NotFound)
        );
    }
}
