//! Storage-root listings for `/LOOK`.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Kind of a listed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A directory.
    Folder,
    /// A regular file.
    File,
}

/// One entry of a storage listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// File or folder.
    pub kind: EntryKind,
    /// Path relative to the storage root, `/`-separated.
    pub path: String,
    /// File size, or total size of the files below a folder.
    pub size: u64,
}

impl Entry {
    /// Human-readable descriptor.
    pub fn describe(&self) -> String {
        let tag = match self.kind {
            EntryKind::Folder => "FOLDER",
            EntryKind::File => "FILE",
        };
        format!("[{}] {} (Size: {} bytes)", tag, self.path, self.size)
    }
}

/// Recursive listing of a storage root.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    /// Folders, sorted by path.
    pub folders: Vec<Entry>,
    /// Files, sorted by path.
    pub files: Vec<Entry>,
}

impl Listing {
    /// Walk `root` and classify every entry below it.
    ///
    /// A missing or non-directory root is an error, never an empty listing.
    pub fn scan(root: &Path) -> Result<Self> {
        let meta = std::fs::metadata(root).map_err(|e| Error::resource(root, e))?;
        if !meta.is_dir() {
            return Err(Error::Resource(format!("{} is not a directory", root.display())));
        }

        let mut folders: BTreeMap<PathBuf, u64> = BTreeMap::new();
        let mut files = Vec::new();

        for entry in WalkDir::new(root).min_depth(1) {
            let entry = entry.map_err(|e| Error::Resource(format!("walk {}: {}", root.display(), e)))?;
            let relative = match entry.path().strip_prefix(root) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => continue,
            };

            if entry.file_type().is_dir() {
                folders.entry(relative).or_insert(0);
            } else if entry.file_type().is_file() {
                let size = entry
                    .metadata()
                    .map_err(|e| Error::Resource(format!("{}: {}", entry.path().display(), e)))?
                    .len();
                for ancestor in relative.ancestors().skip(1) {
                    if ancestor.as_os_str().is_empty() {
                        break;
                    }
                    *folders.entry(ancestor.to_path_buf()).or_insert(0) += size;
                }
                files.push(Entry {
                    kind: EntryKind::File,
                    path: slash_path(&relative),
                    size,
                });
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        let folders = folders
            .into_iter()
            .map(|(path, size)| Entry {
                kind: EntryKind::Folder,
                path: slash_path(&path),
                size,
            })
            .collect();

        Ok(Self { folders, files })
    }

    /// Whether the root holds nothing.
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.files.is_empty()
    }

    /// Newline-joined listing as sent in a `/LOOK_RESPONSE` payload.
    pub fn render(&self) -> String {
        if self.is_empty() {
            return "Directory is empty".to_string();
        }

        let mut lines = Vec::with_capacity(self.folders.len() + self.files.len() + 2);
        if !self.folders.is_empty() {
            lines.push("=== FOLDERS ===".to_string());
            lines.extend(self.folders.iter().map(Entry::describe));
        }
        if !self.files.is_empty() {
            lines.push("=== FILES ===".to_string());
            lines.extend(self.files.iter().map(Entry::describe));
        }
        lines.join("\n")
    }
}

/// Scan on the blocking pool and render.
pub async fn list_storage(root: &Path) -> Result<String> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || Listing::scan(&root).map(|listing| listing.render()))
        .await
        .map_err(|e| Error::Resource(format!("listing task failed: {}", e)))?
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
