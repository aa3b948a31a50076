//! Generation publishing for an index root.
//!
//! A build writes into a private staging directory while holding an
//! exclusive `fs2` lock on `.build.lock`. Committing renames the staging
//! directory to the next `gen-NNNNNN`, swaps `CURRENT` through a temporary
//! file and removes every generation except the new one and its predecessor.
//! Readers never lock: they follow `CURRENT`, and a published generation is
//! never modified.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Error, Result};

/// Name of the lock file inside an index root.
pub const LOCK_FILE: &str = ".build.lock";

const CURRENT_FILE: &str = "CURRENT";
const GENERATION_PREFIX: &str = "gen-";
const STAGING_PREFIX: &str = ".staging-";

/// An in-progress generation under an index root.
///
/// Holds the build lock from [`begin`](Publication::begin) until it is
/// committed or dropped. Dropping without committing removes the staging
/// directory and leaves the published generation untouched.
pub struct Publication {
    root: PathBuf,
    lock: File,
    name: String,
    staging: PathBuf,
    committed: bool,
}

impl Publication {
    /// Lock `root` (creating it if needed), blocking while another build
    /// holds it, and create a fresh staging directory.
    pub fn begin(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let lock = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        lock.lock_exclusive()?;

        let generation = next_generation(root)?;
        let staging = root.join(format!("{}{:06}", STAGING_PREFIX, generation));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir(&staging)?;

        tracing::debug!(path = %staging.display(), "staging index generation");

        Ok(Self {
            root: root.to_path_buf(),
            lock,
            name: generation_name(generation),
            staging,
            committed: false,
        })
    }

    /// Directory the new generation's files go into.
    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// Publish the staged generation and return its final path.
    pub fn commit(mut self) -> Result<PathBuf> {
        let target = self.root.join(&self.name);
        fs::rename(&self.staging, &target)?;
        self.committed = true;

        let previous = read_current(&self.root)?;
        write_current(&self.root, &self.name)?;
        collect_garbage(&self.root, &self.name, previous.as_deref())?;

        Ok(target)
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_dir_all(&self.staging);
        }
        let _ = self.lock.unlock();
    }
}

/// Path of the generation `CURRENT` points to.
pub fn published_generation(root: &Path) -> Result<PathBuf> {
    let name = read_current(root)?
        .ok_or_else(|| Error::IndexLoad(format!("no index published at {}", root.display())))?;
    if parse_generation(&name, GENERATION_PREFIX).is_none() {
        return Err(Error::IndexCorruption(format!(
            "CURRENT points to invalid generation {:?}",
            name
        )));
    }
    Ok(root.join(name))
}

fn generation_name(generation: u64) -> String {
    format!("{}{:06}", GENERATION_PREFIX, generation)
}

fn parse_generation(name: &str, prefix: &str) -> Option<u64> {
    name.strip_prefix(prefix)?.parse().ok()
}

/// One past the highest generation or staging number present under `root`.
fn next_generation(root: &Path) -> Result<u64> {
    let mut highest = 0;
    for entry in fs::read_dir(root)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        let number = parse_generation(&name, GENERATION_PREFIX)
            .or_else(|| parse_generation(&name, STAGING_PREFIX));
        if let Some(n) = number {
            highest = highest.max(n);
        }
    }
    Ok(highest + 1)
}

fn read_current(root: &Path) -> Result<Option<String>> {
    match fs::read_to_string(root.join(CURRENT_FILE)) {
        Ok(content) => Ok(Some(content.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_current(root: &Path, name: &str) -> Result<()> {
    let tmp = root.join(format!("{}.tmp", CURRENT_FILE));
    {
        let mut file = File::create(&tmp)?;
        writeln!(file, "{}", name)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, root.join(CURRENT_FILE))?;
    Ok(())
}

/// Remove generations other than `current` and `previous`, and staging
/// directories left by interrupted builds.
fn collect_garbage(root: &Path, current: &str, previous: Option<&str>) -> Result<()> {
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let stale_generation = parse_generation(&name, GENERATION_PREFIX).is_some()
            && name != current
            && Some(name.as_ref()) != previous;
        let stale_staging = parse_generation(&name, STAGING_PREFIX).is_some();
        if stale_generation || stale_staging {
            tracing::debug!(entry = %name, "removing stale index directory");
            fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}
