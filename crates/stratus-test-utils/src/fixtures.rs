//! Filesystem fixtures for deployment tests.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Write `files` (relative path, contents) under `dir`, creating parents
pub fn write_tree(dir: &Path, files: &[(&str, &str)]) -> io::Result<()> {
    for (relative, contents) in files {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
    }
    Ok(())
}

/// A throwaway source module plus deployment root.
///
/// Both directories are removed when the fixture is dropped.
pub struct ModuleFixture {
    temp: TempDir,
    /// Source module directory
    pub module_dir: PathBuf,
    /// Deployment root, not created up front
    pub root_dir: PathBuf,
}

impl ModuleFixture {
    /// Create a module called `name` containing `files`
    pub fn new(name: &str, files: &[(&str, &str)]) -> io::Result<Self> {
        let temp = tempfile::tempdir()?;
        let module_dir = temp.path().join("src").join(name);
        let root_dir = temp.path().join("root");
        fs::create_dir_all(&module_dir)?;
        write_tree(&module_dir, files)?;
        Ok(Self {
            temp,
            module_dir,
            root_dir,
        })
    }

    /// Scratch directory that outlives neither the module nor the root
    pub fn path(&self) -> &Path {
        self.temp.path()
    }
}
