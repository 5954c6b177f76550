use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::info;
use zip::ZipArchive;

use crate::error::RdaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    Zip,
}

impl ArchiveKind {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "tar" => Some(ArchiveKind::Tar),
            "tar.gz" | "tgz" => Some(ArchiveKind::TarGz),
            "zip" => Some(ArchiveKind::Zip),
            _ => None,
        }
    }
}

pub fn detect_archive(file_name: &str, extensions: &[String]) -> Option<ArchiveKind> {
    let lower = file_name.to_ascii_lowercase();
    let mut enabled = extensions
        .iter()
        .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
        .collect::<Vec<_>>();
    enabled.sort_by_key(|ext| std::cmp::Reverse(ext.len()));
    enabled
        .iter()
        .find(|ext| lower.ends_with(&format!(".{ext}")))
        .and_then(|ext| ArchiveKind::from_extension(ext))
}

pub fn expand_archives(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, RdaError> {
    let mut archives = Vec::new();
    let entries = fs::read_dir(dir).map_err(|err| RdaError::Filesystem(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| RdaError::Filesystem(err.to_string()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if let Some(kind) = detect_archive(name, extensions) {
            archives.push((path.clone(), kind));
        }
    }
    archives.sort_by(|a, b| a.0.cmp(&b.0));

    let mut expanded = Vec::with_capacity(archives.len());
    for (path, kind) in archives {
        info!(archive = %path.display(), ?kind, "expanding archive");
        match kind {
            ArchiveKind::Tar => extract_tar(&path, dir)?,
            ArchiveKind::TarGz => extract_tar_gz(&path, dir)?,
            ArchiveKind::Zip => extract_zip(&path, dir)?,
        }
        fs::remove_file(&path).map_err(|err| {
            RdaError::Filesystem(format!("remove archive {}: {err}", path.display()))
        })?;
        expanded.push(path);
    }
    Ok(expanded)
}

pub fn extract_tar(tar_path: &Path, target_dir: &Path) -> Result<(), RdaError> {
    let file = fs::File::open(tar_path)
        .map_err(|err| RdaError::Filesystem(format!("open tar {}: {err}", tar_path.display())))?;
    unpack_tar(Archive::new(file), tar_path, target_dir)
}

pub fn extract_tar_gz(tar_path: &Path, target_dir: &Path) -> Result<(), RdaError> {
    let file = fs::File::open(tar_path)
        .map_err(|err| RdaError::Filesystem(format!("open tar {}: {err}", tar_path.display())))?;
    unpack_tar(Archive::new(GzDecoder::new(file)), tar_path, target_dir)
}

fn unpack_tar<R: io::Read>(
    mut archive: Archive<R>,
    tar_path: &Path,
    target_dir: &Path,
) -> Result<(), RdaError> {
    let entries = archive
        .entries()
        .map_err(|err| RdaError::Archive(format!("{}: {err}", tar_path.display())))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|err| RdaError::Archive(format!("{}: {err}", tar_path.display())))?;
        let unpacked = entry
            .unpack_in(target_dir)
            .map_err(|err| RdaError::Archive(format!("{}: {err}", tar_path.display())))?;
        if !unpacked {
            return Err(RdaError::Archive(format!(
                "{}: tar entry path traversal detected",
                tar_path.display()
            )));
        }
    }
    Ok(())
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), RdaError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| RdaError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive = ZipArchive::new(file).map_err(|err| RdaError::Archive(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| RdaError::Archive(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(RdaError::Archive(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path).map_err(|err| RdaError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| RdaError::Filesystem(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| RdaError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| RdaError::Filesystem(err.to_string()))?;
    }
    Ok(())
}
