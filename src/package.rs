use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use zip::write::SimpleFileOptions;

use crate::cli::PackArgs;
use crate::staging::{ensure_dir, to_slash_path};
use crate::toc::sanitize_title;

pub const MIMETYPE: &str = "mimetype";

/// `<sanitized title>-<book id>.epub`. The book id goes through the same
/// sanitizer as the title, so it cannot add path separators.
pub fn epub_file_name(sanitized_title: &str, book_id: &str) -> String {
    format!("{sanitized_title}-{}.epub", sanitize_title(book_id))
}

/// Zips `staging_root` (its contents become the archive root) and moves the
/// archive to `<output_dir>/<sanitized title>-<book id>.epub`, replacing any
/// existing file there.
///
/// The archive is assembled in a hidden temporary file inside `output_dir`
/// and renamed into place, so the destination never shows a partial archive.
pub fn package(
    staging_root: &Path,
    sanitized_title: &str,
    book_id: &str,
    output_dir: &Path,
) -> anyhow::Result<PathBuf> {
    if !staging_root.is_dir() {
        anyhow::bail!("staging directory not found: {}", staging_root.display());
    }
    ensure_dir(output_dir)
        .with_context(|| format!("create output dir: {}", output_dir.display()))?;

    let partial = tempfile::Builder::new()
        .prefix(".safaribooks-")
        .suffix(".epub.partial")
        .tempfile_in(output_dir)
        .with_context(|| format!("create temporary archive in {}", output_dir.display()))?;

    write_zip(staging_root, partial.as_file()).context("write archive")?;
    tracing::info!(path = %partial.path().display(), "made archive");

    let epub_path = output_dir.join(epub_file_name(sanitized_title, book_id));
    tracing::info!(
        from = %partial.path().display(),
        to = %epub_path.display(),
        "moving archive"
    );
    partial
        .persist(&epub_path)
        .map_err(|err| err.error)
        .with_context(|| format!("move archive to {}", epub_path.display()))?;

    Ok(epub_path)
}

pub fn run(args: PackArgs) -> anyhow::Result<()> {
    let staging = PathBuf::from(&args.staging);
    let out_dir = PathBuf::from(&args.out);
    let path = package(&staging, &sanitize_title(&args.title), &args.book_id, &out_dir)
        .context("package staging tree")?;
    println!("{}", path.display());
    Ok(())
}

fn write_zip(staging_root: &Path, out: &fs::File) -> anyhow::Result<()> {
    let mut zip = zip::ZipWriter::new(out);

    // `mimetype` goes first and uncompressed so readers can sniff the format.
    let stored = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);
    let deflated = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mimetype_path = staging_root.join(MIMETYPE);
    if mimetype_path.is_file() {
        let bytes = fs::read(&mimetype_path)
            .with_context(|| format!("read {}", mimetype_path.display()))?;
        zip.start_file(MIMETYPE, stored)
            .context("start_file mimetype")?;
        zip.write_all(&bytes).context("write mimetype")?;
    }

    for (name, path) in archive_entries(staging_root)? {
        if name == MIMETYPE {
            continue;
        }
        let mut file =
            fs::File::open(&path).with_context(|| format!("open {}", path.display()))?;
        zip.start_file(name.as_str(), deflated)
            .with_context(|| format!("start_file {name}"))?;
        std::io::copy(&mut file, &mut zip).with_context(|| format!("write {name}"))?;
    }

    zip.finish().context("finish zip")?;
    Ok(())
}

/// Every regular file under `root` keyed by its `/`-separated entry name,
/// in name order so archives of the same tree list entries identically.
fn archive_entries(root: &Path) -> anyhow::Result<BTreeMap<String, PathBuf>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, PathBuf>) -> anyhow::Result<()> {
        for entry in fs::read_dir(dir).with_context(|| format!("read dir: {}", dir.display()))? {
            let entry = entry.with_context(|| format!("list dir: {}", dir.display()))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .with_context(|| format!("read entry type: {}", path.display()))?;
            if file_type.is_dir() {
                walk(root, &path, out)?;
            } else if file_type.is_file() {
                let rel = path
                    .strip_prefix(root)
                    .with_context(|| format!("strip staging prefix: {}", path.display()))?;
                out.insert(to_slash_path(rel), path.clone());
            }
        }
        Ok(())
    }

    let mut entries = BTreeMap::new();
    walk(root, root, &mut entries)?;
    Ok(entries)
}
