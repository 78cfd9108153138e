use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Context as _;

/// Files seeded into every staging tree before the first fetch.
pub const SKELETON: &[(&str, &[u8])] = &[
    ("mimetype", include_bytes!("../skeleton/mimetype")),
    (
        "META-INF/container.xml",
        include_bytes!("../skeleton/META-INF/container.xml"),
    ),
    (
        "OEBPS/content.opf",
        include_bytes!("../skeleton/OEBPS/content.opf"),
    ),
    ("OEBPS/toc.ncx", include_bytes!("../skeleton/OEBPS/toc.ncx")),
];

pub const OEBPS_DIR: &str = "OEBPS";

#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    Bytes(&'a [u8]),
    Text(&'a str),
}

impl Payload<'_> {
    /// Text is always stored as UTF-8 regardless of platform defaults.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => text.as_bytes(),
        }
    }
}

/// Write capability over a staging tree. Paths are relative to the tree root.
pub trait StagingFs: Send + Sync {
    fn read_to_string(&self, rel_path: &Path) -> anyhow::Result<String>;
    fn write(&self, rel_path: &Path, payload: Payload<'_>) -> anyhow::Result<()>;
}

/// Per-run temporary directory holding the in-progress EPUB layout.
#[derive(Debug)]
pub struct StagingTree {
    dir: tempfile::TempDir,
}

impl StagingTree {
    /// Creates a fresh tree seeded with the built-in skeleton, or with a copy
    /// of `skeleton_dir` when one is given.
    pub fn create(skeleton_dir: Option<&Path>) -> anyhow::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("safaribooks-")
            .tempdir()
            .context("create staging dir")?;
        let tree = Self { dir };
        tracing::info!(path = %tree.root().display(), "using staging directory");

        match skeleton_dir {
            Some(src) => copy_dir_recursively(src, tree.root())
                .with_context(|| format!("copy skeleton: {}", src.display()))?,
            None => {
                for &(rel, bytes) in SKELETON {
                    tree.write(Path::new(rel), Payload::Bytes(bytes))
                        .with_context(|| format!("seed skeleton file: {rel}"))?;
                }
            }
        }

        Ok(tree)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Detaches the directory from cleanup and returns its path.
    pub fn keep(self) -> PathBuf {
        self.dir.keep()
    }

    fn resolve(&self, rel_path: &Path) -> anyhow::Result<PathBuf> {
        ensure_relative_inside(rel_path)?;
        Ok(self.root().join(rel_path))
    }
}

impl StagingFs for StagingTree {
    fn read_to_string(&self, rel_path: &Path) -> anyhow::Result<String> {
        let path = self.resolve(rel_path)?;
        std::fs::read_to_string(&path)
            .with_context(|| format!("read staging file: {}", path.display()))
    }

    fn write(&self, rel_path: &Path, payload: Payload<'_>) -> anyhow::Result<()> {
        let path = self.resolve(rel_path)?;
        if let Some(parent) = path.parent() {
            ensure_dir(parent)
                .with_context(|| format!("create staging dir: {}", parent.display()))?;
        }
        std::fs::write(&path, payload.as_bytes())
            .with_context(|| format!("write staging file: {}", path.display()))
    }
}

/// In-memory staging tree, for exercising the crawler without a filesystem.
#[derive(Debug, Default)]
pub struct MemoryStaging {
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemoryStaging {
    pub fn seeded() -> Self {
        let staging = Self::default();
        {
            let mut files = staging.files.lock().unwrap_or_else(PoisonError::into_inner);
            for &(rel, bytes) in SKELETON {
                files.insert(PathBuf::from(rel), bytes.to_vec());
            }
        }
        staging
    }

    pub fn get(&self, rel_path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(rel_path.as_ref())
            .cloned()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl StagingFs for MemoryStaging {
    fn read_to_string(&self, rel_path: &Path) -> anyhow::Result<String> {
        ensure_relative_inside(rel_path)?;
        let bytes = self
            .get(rel_path)
            .ok_or_else(|| anyhow::anyhow!("staging file not found: {}", rel_path.display()))?;
        String::from_utf8(bytes)
            .with_context(|| format!("staging file is not utf-8: {}", rel_path.display()))
    }

    fn write(&self, rel_path: &Path, payload: Payload<'_>) -> anyhow::Result<()> {
        ensure_relative_inside(rel_path)?;
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(rel_path.to_path_buf(), payload.as_bytes().to_vec());
        Ok(())
    }
}

/// Creates `path` and its parents. A directory that already exists, possibly
/// created by a sibling fetch a moment ago, is not an error.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    match std::fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(err) => Err(err),
    }
}

/// Turns a host-supplied path into one that stays inside the tree: separators
/// are normalized and every empty, `.` or `..` segment is dropped.
pub fn sanitize_relative_path(raw: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for segment in raw.split(['/', '\\']) {
        let segment = segment.trim();
        if segment.is_empty() || segment == "." || segment == ".." {
            continue;
        }
        out.push(segment);
    }
    if out.as_os_str().is_empty() {
        return None;
    }
    Some(out)
}

/// `rel` joined with `/`, the separator used in archive entries, manifest
/// hrefs and host URLs.
pub fn to_slash_path(rel: &Path) -> String {
    let mut out = String::new();
    for component in rel.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}

/// Path of `rel` under the `OEBPS/` content directory.
pub fn oebps_path(rel: &Path) -> PathBuf {
    Path::new(OEBPS_DIR).join(rel)
}

fn ensure_relative_inside(rel_path: &Path) -> anyhow::Result<()> {
    if rel_path.as_os_str().is_empty() {
        anyhow::bail!("staging path must not be empty");
    }
    for component in rel_path.components() {
        if !matches!(component, Component::Normal(_)) {
            anyhow::bail!(
                "staging path must stay inside the tree: {}",
                rel_path.display()
            );
        }
    }
    Ok(())
}

fn copy_dir_recursively(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        ensure_dir(&to).with_context(|| format!("create dir: {}", to.display()))?;
        for entry in
            std::fs::read_dir(&from).with_context(|| format!("read dir: {}", from.display()))?
        {
            let entry = entry.with_context(|| format!("list dir: {}", from.display()))?;
            let file_type = entry.file_type().context("read entry type")?;
            let target = to.join(entry.file_name());
            if file_type.is_dir() {
                stack.push((entry.path(), target));
            } else if file_type.is_file() {
                std::fs::copy(entry.path(), &target).with_context(|| {
                    format!(
                        "copy {} -> {}",
                        entry.path().display(),
                        target.display()
                    )
                })?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_seeds_skeleton() {
        let tree = StagingTree::create(None).unwrap();
        assert!(tree.root().join("mimetype").is_file());
        assert!(tree.root().join("META-INF/container.xml").is_file());
        assert!(tree.root().join("OEBPS/content.opf").is_file());
        assert!(tree.root().join("OEBPS/toc.ncx").is_file());
        assert_eq!(
            std::fs::read(tree.root().join("mimetype")).unwrap(),
            b"application/epub+zip"
        );
    }

    #[test]
    fn create_copies_custom_skeleton() {
        let src = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("OEBPS")).unwrap();
        std::fs::write(src.path().join("OEBPS/content.opf"), "custom").unwrap();

        let tree = StagingTree::create(Some(src.path())).unwrap();
        assert_eq!(
            tree.read_to_string(Path::new("OEBPS/content.opf")).unwrap(),
            "custom"
        );
        assert!(!tree.root().join("mimetype").exists());
    }

    #[test]
    fn staging_dir_is_removed_on_drop_unless_kept() {
        let tree = StagingTree::create(None).unwrap();
        let root = tree.root().to_path_buf();
        drop(tree);
        assert!(!root.exists());

        let kept = StagingTree::create(None).unwrap().keep();
        assert!(kept.join("OEBPS").is_dir());
        std::fs::remove_dir_all(kept).unwrap();
    }

    #[test]
    fn write_creates_nested_dirs_and_overwrites() {
        let tree = StagingTree::create(None).unwrap();
        let rel = Path::new("OEBPS/part1/images/fig.png");
        tree.write(rel, Payload::Bytes(&[1, 2, 3])).unwrap();
        tree.write(rel, Payload::Bytes(&[4])).unwrap();
        assert_eq!(std::fs::read(tree.root().join(rel)).unwrap(), vec![4]);
    }

    #[test]
    fn text_payload_is_utf8() {
        let tree = StagingTree::create(None).unwrap();
        let rel = Path::new("OEBPS/ja.html");
        tree.write(rel, Payload::Text("日本語")).unwrap();
        assert_eq!(
            std::fs::read(tree.root().join(rel)).unwrap(),
            "日本語".as_bytes()
        );
    }

    #[test]
    fn write_rejects_escaping_paths() {
        let tree = StagingTree::create(None).unwrap();
        assert!(tree.write(Path::new("../x"), Payload::Text("x")).is_err());
        assert!(tree.write(Path::new("/etc/x"), Payload::Text("x")).is_err());
        assert!(tree.write(Path::new(""), Payload::Text("x")).is_err());
    }

    #[test]
    fn ensure_dir_is_idempotent() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = temp.path().join("a/b/c");
        ensure_dir(&dir).unwrap();
        std::fs::write(dir.join("f"), "x").unwrap();
        ensure_dir(&dir).unwrap();
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[test]
    fn ensure_dir_tolerates_concurrent_creation() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = temp.path().join("x/y/z");
        let handles = (0..16)
            .map(|_| {
                let dir = dir.clone();
                std::thread::spawn(move || ensure_dir(&dir))
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert!(dir.is_dir());
    }

    #[test]
    fn ensure_dir_fails_when_a_file_is_in_the_way() {
        let temp = tempfile::TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        assert!(ensure_dir(&blocker).is_err());
    }

    #[test]
    fn sanitize_strips_parent_segments() {
        assert_eq!(
            sanitize_relative_path("../graphics/fig1.png"),
            Some(PathBuf::from("graphics/fig1.png"))
        );
        assert_eq!(
            sanitize_relative_path("../../../etc/passwd"),
            Some(PathBuf::from("etc/passwd"))
        );
        assert_eq!(
            sanitize_relative_path("a/../../b\\c.png"),
            Some(PathBuf::from("a/b/c.png"))
        );
        assert_eq!(
            sanitize_relative_path("/abs/./x.html"),
            Some(PathBuf::from("abs/x.html"))
        );
        assert_eq!(sanitize_relative_path("../.."), None);
        assert_eq!(sanitize_relative_path(""), None);
    }

    #[test]
    fn slash_path_joins_components() {
        let rel = sanitize_relative_path("..\\graphics\\fig 1.png").unwrap();
        assert_eq!(to_slash_path(&rel), "graphics/fig 1.png");
        assert_eq!(to_slash_path(Path::new("")), "");
    }

    #[test]
    fn sanitized_paths_never_leave_the_tree() {
        let tree = StagingTree::create(None).unwrap();
        for raw in ["../x.png", "../../a/../../b.png", "..\\..\\c.png", "./../d/e.png"] {
            let rel = oebps_path(&sanitize_relative_path(raw).unwrap());
            tree.write(&rel, Payload::Bytes(b"img")).unwrap();
            let written = tree.root().join(&rel).canonicalize().unwrap();
            let root = tree.root().join(OEBPS_DIR).canonicalize().unwrap();
            assert!(written.starts_with(&root), "{raw} escaped to {}", written.display());
        }
    }

    #[test]
    fn memory_staging_round_trips_skeleton() {
        let staging = MemoryStaging::seeded();
        let opf = staging
            .read_to_string(Path::new("OEBPS/content.opf"))
            .unwrap();
        assert!(opf.contains("{{ info.title }}"));
        staging
            .write(Path::new("OEBPS/content.opf"), Payload::Text("done"))
            .unwrap();
        assert_eq!(staging.get("OEBPS/content.opf").unwrap(), b"done");
        assert!(staging.write(Path::new("../x"), Payload::Text("x")).is_err());
    }
}
