use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::{FragmentStore, Row};
use crate::error::{CuratorError, CuratorResult};

/// In-process row store. Used by tests and single-node deployments that do not need the rows to
/// outlive the process.
#[derive(Clone, Default)]
pub struct MemoryFragmentStore {
    rows: Arc<parking_lot::RwLock<HashMap<String, Vec<Row>>>>,
}

impl MemoryFragmentStore {
    pub fn new() -> Self { Self::default() }
}

impl FragmentStore for MemoryFragmentStore {
    fn clear(&self, fid: &str) -> CuratorResult<()> {
        self.rows.write().remove(fid);
        Ok(())
    }

    fn append(&self, fid: &str, row: &Row) -> CuratorResult<()> {
        self.rows.write().entry(fid.to_string()).or_default().push(row.clone());
        Ok(())
    }

    fn rows(&self, fid: &str) -> CuratorResult<Vec<Row>> {
        Ok(self.rows.read().get(fid).cloned().unwrap_or_default())
    }
}

/// Row store keeping one JSON-lines file per fragment under `<root>/fragments/`.
#[derive(Clone, Debug)]
pub struct FileFragmentStore {
    pub(crate) root: PathBuf,
}

impl FileFragmentStore {
    /// Create a store rooted at the given path. The directory is created if it does not exist.
    pub fn new<P: AsRef<Path>>(root: P) -> CuratorResult<Self> {
        let s = Self { root: root.as_ref().to_path_buf() };
        fs::create_dir_all(s.fragments_dir())?;
        Ok(s)
    }
}

impl FragmentStore for FileFragmentStore {
    fn clear(&self, fid: &str) -> CuratorResult<()> {
        let path = self.fragment_file(fid);
        match fs::remove_file(&path) {
            Ok(()) => { debug!(target: "store", "cleared {}", path.display()); Ok(()) }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn append(&self, fid: &str, row: &Row) -> CuratorResult<()> {
        let mut line = serde_json::to_vec(row)?;
        line.push(b'\n');
        let mut f = OpenOptions::new().create(true).append(true).open(self.fragment_file(fid))?;
        f.write_all(&line)?;
        Ok(())
    }

    fn rows(&self, fid: &str) -> CuratorResult<Vec<Row>> {
        let path = self.fragment_file(fid);
        let f = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for (i, line) in BufReader::new(f).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() { continue; }
            let row: Row = serde_json::from_str(&line)
                .map_err(|e| CuratorError::store(format!("{} line {}: {}", path.display(), i + 1, e)))?;
            out.push(row);
        }
        Ok(out)
    }
}
