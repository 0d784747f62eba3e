//! Output packaging: an in-memory archive with deterministic entry order,
//! directory snapshots, and overlay merging with defined precedence.
//!
//! The instrumenter relies on the merge precedence to keep untouched classes
//! byte-identical: it re-emits only edited classes and overlays them onto an
//! unmodified snapshot of the original tree.

use log::debug;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use zip::read::ZipArchive;
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::types::{HarnessError, HarnessResult};

/// An in-memory archive. Entries are kept in a `BTreeMap` so serialization
/// is deterministic.
#[derive(Debug, Default, Clone)]
pub struct Archive {
    entries: BTreeMap<String, Vec<u8>>,
}

impl Archive {
    pub fn new() -> Archive {
        Archive::default()
    }

    /// Snapshot a directory tree. `filter` restricts which files enter the
    /// archive; pass `|_| true` for the whole tree.
    pub fn from_directory(
        dir: impl AsRef<Path>,
        filter: impl Fn(&Path) -> bool,
    ) -> HarnessResult<Archive> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(HarnessError::new(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        let mut archive = Archive::new();
        gather_entries(dir, dir, &filter, &mut archive.entries)?;
        Ok(archive)
    }

    /// Load an archive from a zip file on disk.
    pub fn from_file(path: impl AsRef<Path>) -> HarnessResult<Archive> {
        let file = File::open(path.as_ref())?;
        let mut zip = ZipArchive::new(file)?;
        let mut entries = BTreeMap::new();
        for idx in 0..zip.len() {
            let mut entry = zip.by_index(idx)?;
            if entry.name().ends_with('/') {
                continue;
            }
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            entries.insert(entry.name().to_string(), data);
        }
        Ok(Archive { entries })
    }

    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    pub fn entry(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(|v| v.as_slice())
    }

    pub fn insert(&mut self, name: &str, data: Vec<u8>) -> HarnessResult<()> {
        self.entries.insert(normalize_entry_name(name)?, data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overlays `other` onto this archive: on a name collision the entry
    /// from `other` wins. Entries only present here stay untouched.
    pub fn overlay(&mut self, other: Archive) {
        for (name, data) in other.entries {
            if self.entries.contains_key(&name) {
                debug!("overlay: replacing {name}");
            }
            self.entries.insert(name, data);
        }
    }

    /// Serialize as a zip file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> HarnessResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        let mut zip = ZipWriter::new(file);
        let options =
            FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, data) in &self.entries {
            zip.start_file(name, options)?;
            zip.write_all(data)?;
        }
        zip.finish()?;
        Ok(())
    }

    /// Materialize the entries into a directory (overwrites existing files).
    pub fn write_to_directory(&self, dir: impl AsRef<Path>) -> HarnessResult<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        for (name, data) in &self.entries {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, data)?;
        }
        Ok(())
    }
}

fn gather_entries(
    root: &Path,
    current: &Path,
    filter: &impl Fn(&Path) -> bool,
    entries: &mut BTreeMap<String, Vec<u8>>,
) -> HarnessResult<()> {
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            gather_entries(root, &path, filter, entries)?;
            continue;
        }
        if !entry.file_type()?.is_file() || !filter(&path) {
            continue;
        }
        let rel = path.strip_prefix(root).map_err(|_| {
            HarnessError::new(format!(
                "{} is not under {}",
                path.display(),
                root.display()
            ))
        })?;
        let name = normalize_entry_name(&rel.to_string_lossy())?;
        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;
        entries.insert(name, data);
    }
    Ok(())
}

fn normalize_entry_name(name: &str) -> HarnessResult<String> {
    let mut components = Vec::new();
    for comp in Path::new(name).components() {
        match comp {
            Component::Normal(part) => {
                components.push(part.to_string_lossy().replace('\\', "/"))
            }
            Component::CurDir => {}
            _ => {
                return Err(HarnessError::new(format!(
                    "invalid archive entry name: {name}"
                )));
            }
        }
    }
    if components.is_empty() {
        return Err(HarnessError::new("archive entry name must not be empty"));
    }
    Ok(components.join("/"))
}

/// A filesystem artifact that only lives for the duration of one stage.
/// Deleted on drop, including on the error path.
pub struct TempArtifact {
    path: PathBuf,
}

impl TempArtifact {
    pub fn new(path: PathBuf) -> TempArtifact {
        TempArtifact { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if self.path.is_dir() {
            let _ = fs::remove_dir_all(&self.path);
        } else if self.path.exists() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_new_entries_and_keeps_rest() {
        let mut base = Archive::new();
        base.insert("com/app/A.smali", b"original A".to_vec()).unwrap();
        base.insert("com/app/B.smali", b"original B".to_vec()).unwrap();

        let mut edited = Archive::new();
        edited.insert("com/app/A.smali", b"edited A".to_vec()).unwrap();

        base.overlay(edited);
        assert_eq!(base.entry("com/app/A.smali").unwrap(), b"edited A");
        // Untouched entry stays byte-identical.
        assert_eq!(base.entry("com/app/B.smali").unwrap(), b"original B");
    }

    #[test]
    fn directory_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("com/app")).unwrap();
        fs::write(dir.path().join("com/app/A.smali"), b"class A").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();

        let archive =
            Archive::from_directory(dir.path(), |p| p.extension().is_some_and(|e| e == "smali"))
                .unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.entry("com/app/A.smali").unwrap(), b"class A");

        let out = dir.path().join("out");
        archive.write_to_directory(&out).unwrap();
        assert_eq!(fs::read(out.join("com/app/A.smali")).unwrap(), b"class A");
    }

    #[test]
    fn zip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::new();
        archive.insert("classes/Main.smali", b"main".to_vec()).unwrap();
        let path = dir.path().join("out.zip");
        archive.write_to_file(&path).unwrap();

        let read_back = Archive::from_file(&path).unwrap();
        assert_eq!(read_back.entry("classes/Main.smali").unwrap(), b"main");
    }

    #[test]
    fn temp_artifact_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intermediate.zip");
        fs::write(&path, b"x").unwrap();
        {
            let _guard = TempArtifact::new(path.clone());
        }
        assert!(!path.exists());
    }

    #[test]
    fn rejects_escaping_entry_names() {
        let mut archive = Archive::new();
        assert!(archive.insert("../evil", b"x".to_vec()).is_err());
    }
}
