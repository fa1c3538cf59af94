use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use crate::{collaborators::Preparer, error::PrepareError};

const PREVIEW_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "gif"];

/// Builds the batch-upload layout: preview renders at the root plus one zip
/// per top-level folder of the bundle.
#[derive(Debug, Default)]
pub struct BundlePreparer;

#[async_trait::async_trait]
impl Preparer for BundlePreparer {
    async fn reorganize(&self, extract_dir: &Path, dest: &Path) -> Result<PathBuf, PrepareError> {
        let extract_dir = extract_dir.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || {
            prepare_bundle(&extract_dir, &dest)?;
            Ok(dest)
        })
        .await
        .map_err(|e| PrepareError::Io(format!("prepare task failed: {e}")))?
    }
}

fn io(e: std::io::Error) -> PrepareError {
    PrepareError::Io(e.to_string())
}

pub(crate) fn is_preview_image(path: &Path) -> bool {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let ext_ok = path
        .extension()
        .and_then(|s| s.to_str())
        .is_some_and(|e| PREVIEW_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
    name.contains("_view") && ext_ok
}

/// Regular files below `root`, sorted, symlinks skipped.
pub(crate) fn walk_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for e in fs::read_dir(&dir)? {
            let e = e?;
            let p = e.path();
            let meta = fs::symlink_metadata(&p)?;
            if meta.file_type().is_symlink() {
                continue;
            }
            if meta.is_dir() {
                stack.push(p);
            } else if meta.is_file() {
                out.push(p);
            }
        }
    }
    out.sort();
    Ok(out)
}

fn unique_target(dir: &Path, source: &Path) -> PathBuf {
    let name = source.file_name().unwrap_or_default();
    let first = dir.join(name);
    if !first.exists() {
        return first;
    }
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("preview");
    let ext = source.extension().and_then(|s| s.to_str());
    (1..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem}_{n}.{ext}")),
            None => dir.join(format!("{stem}_{n}")),
        })
        .find(|p| !p.exists())
        .unwrap_or(first)
}

fn zip_dir(src: &Path, zip_path: &Path) -> Result<usize, PrepareError> {
    let f = fs::File::create(zip_path).map_err(io)?;
    let mut zw = zip::ZipWriter::new(f);
    let opts = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    let files = walk_files(src).map_err(io)?;
    for path in &files {
        let Ok(rel) = path.strip_prefix(src) else {
            continue;
        };
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        zw.start_file(name, opts)
            .map_err(|e| PrepareError::Io(e.to_string()))?;
        let mut input = fs::File::open(path).map_err(io)?;
        std::io::copy(&mut input, &mut zw).map_err(io)?;
    }
    let mut f = zw.finish().map_err(|e| PrepareError::Io(e.to_string()))?;
    f.flush().map_err(io)?;
    Ok(files.len())
}

pub(crate) fn prepare_bundle(extract_dir: &Path, out_dir: &Path) -> Result<(), PrepareError> {
    if !extract_dir.is_dir() {
        return Err(PrepareError::Io(format!(
            "extract directory does not exist: {}",
            extract_dir.display()
        )));
    }
    if out_dir.exists() {
        fs::remove_dir_all(out_dir).map_err(io)?;
    }
    fs::create_dir_all(out_dir).map_err(io)?;

    let previews: Vec<PathBuf> = walk_files(extract_dir)
        .map_err(io)?
        .into_iter()
        .filter(|p| is_preview_image(p))
        .collect();
    for preview in &previews {
        let target = unique_target(out_dir, preview);
        fs::copy(preview, &target).map_err(io)?;
        tracing::debug!(from = %preview.display(), to = %target.display(), "copied preview");
    }

    let mut subdirs: Vec<PathBuf> = fs::read_dir(extract_dir)
        .map_err(io)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| {
            !p.file_name()
                .and_then(|s| s.to_str())
                .unwrap_or(".")
                .starts_with('.')
        })
        .collect();
    subdirs.sort();
    for subdir in &subdirs {
        let name = subdir
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("bundle");
        let zip_path = out_dir.join(format!("{name}.zip"));
        let count = zip_dir(subdir, &zip_path).inspect_err(|_| {
            let _ = fs::remove_file(&zip_path);
        })?;
        tracing::debug!(folder = name, files = count, "archived folder");
    }

    let produced = fs::read_dir(out_dir)
        .map_err(io)?
        .flatten()
        .filter(|e| e.path().is_file())
        .count();
    tracing::info!(
        previews = previews.len(),
        archives = subdirs.len(),
        files = produced,
        "prepared upload folder"
    );
    if produced == 0 {
        return Err(PrepareError::Empty(out_dir.display().to_string()));
    }
    Ok(())
}
