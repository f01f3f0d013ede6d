//! Container formats: member listing and single-member extraction.
//!
//! Extraction is one member at a time so peak disk and memory stay bounded;
//! the caller decides when the next member may be pulled.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::fetcher::sanitize_filename;

#[derive(Debug, Error)]
pub enum ExpandError {
    #[error("archive requires a secret")]
    NeedsSecret,
    #[error("secret rejected by archive")]
    WrongSecret,
    #[error("unsupported archive format")]
    Unsupported,
    #[error("member {0} not found in archive")]
    MemberNotFound(usize),
    #[error("archive corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    /// Detect by filename. Unknown extensions are not expanded.
    pub fn detect(path: &Path) -> Option<ArchiveFormat> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }
}

/// Listing entry for one archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub index: usize,
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

/// A member materialized into the extraction root.
#[derive(Debug, Clone)]
pub struct ExtractedMember {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
}

/// Enumerate members without extracting anything.
pub fn list_members(archive: &Path) -> Result<Vec<MemberInfo>, ExpandError> {
    match ArchiveFormat::detect(archive).ok_or(ExpandError::Unsupported)? {
        ArchiveFormat::Zip => list_zip(archive),
        ArchiveFormat::Tar => list_tar(tar_reader(archive, false)?),
        ArchiveFormat::TarGz => list_tar(tar_reader(archive, true)?),
    }
}

/// Whether the archive needs a secret before members can be extracted.
/// Member metadata stays readable either way (central directory).
pub fn needs_secret(archive: &Path) -> Result<bool, ExpandError> {
    match ArchiveFormat::detect(archive).ok_or(ExpandError::Unsupported)? {
        ArchiveFormat::Zip => {
            let file = File::open(archive)?;
            let mut zip = zip::ZipArchive::new(file).map_err(zip_corrupt)?;
            for i in 0..zip.len() {
                let entry = zip.by_index_raw(i).map_err(zip_corrupt)?;
                if entry.encrypted() {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Ok(false),
    }
}

/// Extract member `index` into a unique temp file under `dest_dir`.
pub fn extract_member(
    archive: &Path,
    index: usize,
    dest_dir: &Path,
    secret: Option<&str>,
) -> Result<ExtractedMember, ExpandError> {
    std::fs::create_dir_all(dest_dir)?;
    match ArchiveFormat::detect(archive).ok_or(ExpandError::Unsupported)? {
        ArchiveFormat::Zip => extract_zip_member(archive, index, dest_dir, secret),
        ArchiveFormat::Tar => extract_tar_member(tar_reader(archive, false)?, index, dest_dir),
        ArchiveFormat::TarGz => extract_tar_member(tar_reader(archive, true)?, index, dest_dir),
    }
}

fn list_zip(archive: &Path) -> Result<Vec<MemberInfo>, ExpandError> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(zip_corrupt)?;
    let mut out = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        // Raw access reads metadata without decrypting member payloads, so
        // protected archives can still be enumerated.
        let entry = zip.by_index_raw(i).map_err(zip_corrupt)?;
        out.push(MemberInfo {
            index: i,
            name: entry.name().to_string(),
            size: entry.size(),
            is_dir: entry.is_dir(),
        });
    }
    Ok(out)
}

fn extract_zip_member(
    archive: &Path,
    index: usize,
    dest_dir: &Path,
    secret: Option<&str>,
) -> Result<ExtractedMember, ExpandError> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(zip_corrupt)?;
    if index >= zip.len() {
        return Err(ExpandError::MemberNotFound(index));
    }

    let mut entry = match secret {
        Some(secret) => match zip.by_index_decrypt(index, secret.as_bytes()) {
            Ok(e) => e,
            Err(zip::result::ZipError::InvalidPassword) => return Err(ExpandError::WrongSecret),
            Err(e) => return Err(zip_corrupt(e)),
        },
        None => match zip.by_index(index) {
            Ok(e) => e,
            Err(e) if is_password_error(&e) => return Err(ExpandError::NeedsSecret),
            Err(e) => return Err(zip_corrupt(e)),
        },
    };

    let enclosed_name = entry.enclosed_name();
    let name = sanitize_filename(
        enclosed_name
            .as_deref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("member"),
    );
    let size = entry.size();
    let path = write_unique(dest_dir, &name, &mut entry)?;
    Ok(ExtractedMember { path, name, size })
}

fn tar_reader(archive: &Path, gz: bool) -> Result<tar::Archive<Box<dyn io::Read>>, ExpandError> {
    let file = File::open(archive)?;
    let reader: Box<dyn io::Read> = if gz {
        Box::new(flate2::read::GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(tar::Archive::new(reader))
}

fn list_tar(mut archive: tar::Archive<Box<dyn io::Read>>) -> Result<Vec<MemberInfo>, ExpandError> {
    let mut out = Vec::new();
    for (i, entry) in archive
        .entries()
        .map_err(|e| ExpandError::Corrupt(e.to_string()))?
        .enumerate()
    {
        let entry = entry.map_err(|e| ExpandError::Corrupt(e.to_string()))?;
        let name = entry
            .path()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| format!("member-{i}"));
        out.push(MemberInfo {
            index: i,
            name,
            size: entry.size(),
            is_dir: entry.header().entry_type().is_dir(),
        });
    }
    Ok(out)
}

fn extract_tar_member(
    mut archive: tar::Archive<Box<dyn io::Read>>,
    index: usize,
    dest_dir: &Path,
) -> Result<ExtractedMember, ExpandError> {
    for (i, entry) in archive
        .entries()
        .map_err(|e| ExpandError::Corrupt(e.to_string()))?
        .enumerate()
    {
        let mut entry = entry.map_err(|e| ExpandError::Corrupt(e.to_string()))?;
        if i != index {
            continue;
        }
        let name = sanitize_filename(
            entry
                .path()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .as_deref()
                .unwrap_or("member"),
        );
        let size = entry.size();
        let path = write_unique(dest_dir, &name, &mut entry)?;
        return Ok(ExtractedMember { path, name, size });
    }
    Err(ExpandError::MemberNotFound(index))
}

/// Stream a member into a uniquely named file in the extraction root. The
/// member's extension is kept so downstream kind detection works.
fn write_unique(
    dest_dir: &Path,
    name: &str,
    reader: &mut impl io::Read,
) -> Result<PathBuf, ExpandError> {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s, format!(".{e}")),
        _ => (name, String::new()),
    };
    let tmp = tempfile::Builder::new()
        .prefix(&format!("{stem}-"))
        .suffix(&ext)
        .tempfile_in(dest_dir)?;
    let (mut file, path) = tmp
        .keep()
        .map_err(|e| ExpandError::Io(e.error))?;
    io::copy(reader, &mut file)?;
    file.sync_data()?;
    Ok(path)
}

fn zip_corrupt(e: zip::result::ZipError) -> ExpandError {
    ExpandError::Corrupt(e.to_string())
}

fn is_password_error(e: &zip::result::ZipError) -> bool {
    matches!(e, zip::result::ZipError::UnsupportedArchive(msg) if msg.contains("Password"))
}
