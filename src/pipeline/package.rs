use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::utils::fs;
use crate::utils::logging::RunLog;

pub const IMAGES_DIR: &str = "images";
pub const CAPTIONS_DIR: &str = "captions";

/// Zip every file below `root` into `archive`, named by its path relative to
/// `root` with `/` separators. Entries are written in sorted walk order.
pub fn write_archive(root: &Path, archive: &Path) -> Result<usize> {
    let file = File::create(archive).with_context(|| format!("Failed to create {:?}", archive))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut entries = 0;
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {:?}", root))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root)?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        zip.start_file(name, options)?;
        let data = std::fs::read(entry.path()).with_context(|| format!("Failed to read {:?}", entry.path()))?;
        zip.write_all(&data)?;
        entries += 1;
    }
    let mut inner = zip.finish()?;
    inner.flush()?;
    Ok(entries)
}

/// Copy the final stage result into `<output>/images`, archive the output
/// directory to `<output>.zip` and remove the directory.
pub fn run(final_dir: &Path, output: &Path, log: &RunLog) -> Result<PathBuf> {
    let images = output.join(IMAGES_DIR);
    let copied = fs::copy_tree(final_dir, &images)?;
    log.step(&format!("Copied {} images to {}", copied, images.display()));

    let archive = fs::archive_path_for(output);
    fs::remove_file_if_exists(&archive)?;
    let entries = write_archive(output, &archive)?;
    fs::remove_dir_if_exists(output).with_context(|| format!("Failed to remove {:?}", output))?;
    log.step(&format!("Wrote {} entries to {}", entries, archive.display()));
    Ok(archive)
}
