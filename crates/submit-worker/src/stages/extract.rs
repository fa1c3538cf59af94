use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use crate::{collaborators::Extractor, error::ExtractError};

/// Unpacks zip archives on the blocking pool.
#[derive(Debug, Default)]
pub struct ZipExtractor;

#[async_trait::async_trait]
impl Extractor for ZipExtractor {
    async fn unpack(&self, archive: &Path, dest: &Path) -> Result<PathBuf, ExtractError> {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || {
            extract_zip_safely(&archive, &dest)?;
            Ok(dest)
        })
        .await
        .map_err(|e| ExtractError::Io(format!("extract task failed: {e}")))?
    }
}

fn normalize_rel_path(rel: &str) -> Result<PathBuf, ExtractError> {
    let p = Path::new(rel);
    if p.is_absolute() {
        return Err(ExtractError::UnsafePath(rel.to_string()));
    }
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                return Err(ExtractError::UnsafePath(rel.to_string()));
            }
        }
    }
    Ok(out)
}

fn io(e: std::io::Error) -> ExtractError {
    ExtractError::Io(e.to_string())
}

/// Sibling of `out_dir` holding entries while they are written. Being outside
/// `out_dir`, no archive entry can land on one of its files.
fn staging_dir(out_dir: &Path) -> PathBuf {
    let name = out_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "extract".to_string());
    out_dir.with_file_name(format!("{name}.part"))
}

pub(crate) fn extract_zip_safely(zip_path: &Path, out_dir: &Path) -> Result<(), ExtractError> {
    let f = fs::File::open(zip_path).map_err(io)?;
    let mut archive =
        zip::ZipArchive::new(f).map_err(|e| ExtractError::Corrupt(e.to_string()))?;

    if out_dir.exists() {
        fs::remove_dir_all(out_dir).map_err(io)?;
    }
    fs::create_dir_all(out_dir).map_err(io)?;
    let staging = staging_dir(out_dir);
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(io)?;
    }
    fs::create_dir_all(&staging).map_err(io)?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| ExtractError::Corrupt(e.to_string()))?;
        let name = file.name().replace('\\', "/");
        let trimmed = name.trim_end_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        let rel = normalize_rel_path(trimmed)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out_path = out_dir.join(&rel);
        if file.is_dir() {
            fs::create_dir_all(&out_path).map_err(io)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }
        let tmp_path = staging.join(i.to_string());
        let mut out = fs::File::create(&tmp_path).map_err(io)?;
        std::io::copy(&mut file, &mut out).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                ExtractError::Corrupt(e.to_string())
            } else {
                io(e)
            }
        })?;
        out.sync_all().ok();
        fs::rename(&tmp_path, &out_path).map_err(io)?;
    }
    fs::remove_dir_all(&staging).map_err(io)?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    use std::io::Write;

    let f = fs::File::create(path).unwrap();
    let mut zw = zip::ZipWriter::new(f);
    let opts = zip::write::SimpleFileOptions::default();
    for (name, data) in entries {
        if name.ends_with('/') {
            zw.add_directory(*name, opts).unwrap();
        } else {
            zw.start_file(*name, opts).unwrap();
            zw.write_all(data.as_bytes()).unwrap();
        }
    }
    zw.finish().unwrap();
}
