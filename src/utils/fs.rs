use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::models::MediaItem;

pub fn has_extension(path: &Path, exts: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| exts.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

fn is_png(path: &Path) -> bool {
    path.is_file() && has_extension(path, &["png"])
}

/// PNG files directly inside `dir`, sorted by file name. A missing
/// directory is treated as empty.
pub fn list_pngs(dir: &Path) -> Result<Vec<MediaItem>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut items = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read directory {:?}", dir))? {
        let path = entry?.path();
        if is_png(&path) {
            if let Some(item) = MediaItem::from_path(path) {
                items.push(item);
            }
        }
    }
    items.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(items)
}

/// PNG files anywhere below `dir`, in sorted walk order.
pub fn list_pngs_recursive(dir: &Path) -> Result<Vec<MediaItem>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut items = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {:?}", dir))?;
        if entry.file_type().is_file() && has_extension(entry.path(), &["png"]) {
            if let Some(item) = MediaItem::from_path(entry.path()) {
                items.push(item);
            }
        }
    }
    Ok(items)
}

/// Copy every file below `src` into `dst`, keeping relative paths.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    std::fs::create_dir_all(dst).with_context(|| format!("Failed to create {:?}", dst))?;
    let mut copied = 0;
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {:?}", src))?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {:?} to {:?}", entry.path(), target))?;
            copied += 1;
        }
    }
    Ok(copied)
}

pub fn remove_dir_if_exists(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

pub fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// `<path>.zip`, keeping any existing extension in the file name.
pub fn archive_path_for(output: &Path) -> PathBuf {
    let mut name = output.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".zip");
    output.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lists_only_pngs_sorted() {
        let tmp = TempDir::new().unwrap();
        for name in ["b.png", "a.PNG", "c.txt", "d.jpg"] {
            std::fs::write(tmp.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(tmp.path().join("nested.png")).unwrap();
        let names: Vec<String> = list_pngs(tmp.path()).unwrap().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["a.PNG", "b.png"]);
    }

    #[test]
    fn recursive_listing_descends() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("x/y")).unwrap();
        std::fs::write(tmp.path().join("x/y/deep.png"), b"x").unwrap();
        std::fs::write(tmp.path().join("top.png"), b"x").unwrap();
        let items = list_pngs_recursive(tmp.path()).unwrap();
        assert_eq!(items.len(), 2);
        assert!(list_pngs(&tmp.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn copy_tree_keeps_layout() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("unclassified/cluster_00")).unwrap();
        std::fs::write(src.join("unclassified/cluster_00/a.png"), b"a").unwrap();
        std::fs::write(src.join("b.png"), b"b").unwrap();
        let dst = tmp.path().join("dst");
        assert_eq!(copy_tree(&src, &dst).unwrap(), 2);
        assert_eq!(std::fs::read(dst.join("unclassified/cluster_00/a.png")).unwrap(), b"a");
    }

    #[test]
    fn archive_path_appends_extension() {
        assert_eq!(archive_path_for(Path::new("/out/run1")), PathBuf::from("/out/run1.zip"));
        assert_eq!(archive_path_for(Path::new("/out/set.v2")), PathBuf::from("/out/set.v2.zip"));
    }

    #[test]
    fn removing_missing_paths_is_ok() {
        let tmp = TempDir::new().unwrap();
        remove_dir_if_exists(&tmp.path().join("nope")).unwrap();
        remove_file_if_exists(&tmp.path().join("nope.zip")).unwrap();
    }
}
