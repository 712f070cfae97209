//! Zip codec for folder transfers.
//!
//! Packing and unpacking use blocking file I/O and run on the blocking
//! thread pool.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{self, Seek};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// A folder packed into a temporary zip file.
///
/// The file is deleted when this value is dropped.
#[derive(Debug)]
pub struct PackedFolder {
    file: NamedTempFile,
    size: u64,
}

impl PackedFolder {
    /// Archive length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path of the temporary archive.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Open the archive for streaming.
    pub async fn open(&self) -> Result<tokio::fs::File> {
        tokio::fs::File::open(self.path())
            .await
            .map_err(|e| Error::resource(self.path(), e))
    }
}

/// Zip the contents of `folder`.
pub async fn pack_folder(folder: &Path) -> Result<PackedFolder> {
    let folder = folder.to_path_buf();
    tokio::task::spawn_blocking(move || pack_blocking(&folder))
        .await
        .map_err(|e| Error::Resource(format!("archive task failed: {}", e)))?
}

/// Extract the zip at `archive` into `dest`, creating it if needed.
pub async fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_blocking(&archive, &dest))
        .await
        .map_err(|e| Error::Resource(format!("extract task failed: {}", e)))?
}

fn pack_blocking(folder: &Path) -> Result<PackedFolder> {
    if !folder.is_dir() {
        return Err(Error::Resource(format!("{} is not a folder", folder.display())));
    }

    let temp = NamedTempFile::new().map_err(|e| Error::Resource(format!("temp file: {}", e)))?;
    let handle = temp.reopen().map_err(|e| Error::Resource(format!("temp file: {}", e)))?;
    let mut zip = ZipWriter::new(handle);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(folder).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Resource(format!("walk {}: {}", folder.display(), e)))?;
        let name = entry_name(folder, entry.path())?;

        if entry.file_type().is_dir() {
            zip.add_directory(name, options).map_err(zip_error)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options).map_err(zip_error)?;
            let mut source = File::open(entry.path()).map_err(|e| Error::resource(entry.path(), e))?;
            io::copy(&mut source, &mut zip).map_err(|e| Error::resource(entry.path(), e))?;
        }
    }

    let mut handle = zip.finish().map_err(zip_error)?;
    let size = handle
        .seek(io::SeekFrom::End(0))
        .map_err(|e| Error::Resource(format!("temp file: {}", e)))?;

    Ok(PackedFolder { file: temp, size })
}

fn unpack_blocking(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).map_err(|e| Error::resource(archive, e))?;
    let mut zip = ZipArchive::new(file).map_err(zip_error)?;
    std::fs::create_dir_all(dest).map_err(|e| Error::resource(dest, e))?;
    zip.extract(dest).map_err(zip_error)
}

/// Forward-slash path of `path` relative to `root`.
fn entry_name(root: &Path, path: &Path) -> Result<String> {
    let relative: PathBuf = path
        .strip_prefix(root)
        .map_err(|_| Error::Resource(format!("{} escapes {}", path.display(), root.display())))?
        .to_path_buf();
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn zip_error(e: zip::result::ZipError) -> Error {
    Error::Resource(format!("archive: {}", e))
}
