use std::fs;
use std::path::{Path, PathBuf};

use crate::bytecode::Module;

const SKIP_NAMES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "target",
    ".mutator-state.json",
];

const SKIP_SUFFIXES: &[&str] = &[
    ".mutator-report.json",
    ".mutator.bak",
];

/// A standalone, runnable copy of the suite directory holding one mutant.
/// The directory is removed when this is dropped.
#[derive(Debug)]
pub struct ScratchCopy {
    pub dir: tempfile::TempDir,
    pub module_path: PathBuf,
    pub suite_path: PathBuf,
}

impl ScratchCopy {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

fn should_skip(name: &str) -> bool {
    SKIP_NAMES.iter().any(|s| *s == name)
        || SKIP_SUFFIXES.iter().any(|s| name.ends_with(s))
}

fn copy_dir_filtered(src: &Path, dst: &Path, exclude: Option<&Path>) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if should_skip(&name_str) {
            continue;
        }
        let src_path = entry.path();
        if exclude.is_some_and(|ex| fs::canonicalize(&src_path).is_ok_and(|p| p == ex)) {
            continue;
        }
        let dst_path = dst.join(&name);
        // Follows symlinks so linked dependencies land as real files.
        let meta = fs::metadata(&src_path)?;
        if meta.is_dir() {
            copy_dir_filtered(&src_path, &dst_path, exclude)?;
        } else if meta.is_file() {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Writes mutated modules next to copies of everything the suite needs.
#[derive(Debug, Clone)]
pub struct Materializer {
    source_dir: PathBuf,
    module_rel: PathBuf,
    suite_rel: PathBuf,
    scratch_root: Option<PathBuf>,
    session: String,
}

impl Materializer {
    /// `module_rel` is the module's path relative to the suite directory.
    pub fn new(suite_path: &Path, module_rel: &Path, session: &str) -> Self {
        let source_dir = suite_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let suite_rel = suite_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_default();
        Materializer {
            source_dir,
            module_rel: module_rel.to_path_buf(),
            suite_rel,
            scratch_root: None,
            session: session.to_string(),
        }
    }

    pub fn with_scratch_root(mut self, root: Option<PathBuf>) -> Self {
        self.scratch_root = root;
        self
    }

    pub fn materialize(&self, module: &Module) -> std::io::Result<ScratchCopy> {
        let prefix = format!("mutator-{}-", self.session);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let (dir, exclude) = match &self.scratch_root {
            Some(root) => {
                fs::create_dir_all(root)?;
                (builder.tempdir_in(root)?, Some(fs::canonicalize(root)?))
            }
            None => (builder.tempdir()?, None),
        };

        copy_dir_filtered(&self.source_dir, dir.path(), exclude.as_deref())?;

        let module_path = dir.path().join(&self.module_rel);
        if let Some(parent) = module_path.parent() {
            fs::create_dir_all(parent)?;
        }
        module.save(&module_path)?;

        let suite_path = dir.path().join(&self.suite_rel);
        Ok(ScratchCopy {
            dir,
            module_path,
            suite_path,
        })
    }
}
