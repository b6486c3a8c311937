//! # Cost Log File
//!
//! Append-only text log, one line per record. Each record is written with a
//! single `write_all` on an append handle and synced before returning. Writers
//! in this process are serialized per path; separate processes rely on
//! `O_APPEND` keeping whole-line writes intact.

use chrono::Local;
use dashmap::DashMap;
use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use super::CostRecord;

pub const LOG_HEADER: &str = "# Cost Tracking Log";

/// Per-path write locks shared by every ledger in the process
static LOG_LOCKS: OnceLock<DashMap<PathBuf, Arc<Mutex<()>>>> = OnceLock::new();

fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    LOG_LOCKS
        .get_or_init(DashMap::new)
        .entry(path.to_path_buf())
        .or_default()
        .clone()
}

#[derive(Debug)]
pub struct CostLog {
    path: PathBuf,
}

impl CostLog {
    /// Open the log, starting a fresh one if it is missing or corrupted
    pub fn open(path: &Path) -> io::Result<Self> {
        let lock = lock_for(path);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        match fs::read(path) {
            Ok(bytes) => Self::repair(path, &bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn repair(path: &Path, bytes: &[u8]) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let intact = std::str::from_utf8(bytes)
            .map(|text| text.lines().next() == Some(LOG_HEADER))
            .unwrap_or(false);

        if !intact {
            let aside = corrupt_path(path);
            warn!(
                "Cost log {} is corrupted, moving it to {} and starting fresh",
                path.display(),
                aside.display()
            );
            fs::rename(path, &aside)?;
            return Ok(());
        }

        if !bytes.ends_with(b"\n") {
            warn!("Cost log {} ends in a partial line, terminating it", path.display());
            let mut file = OpenOptions::new().append(true).open(path)?;
            file.write_all(b"\n")?;
            file.sync_data()?;
        }
        Ok(())
    }

    /// Append one record as a single line
    pub fn append(&self, record: &CostRecord) -> io::Result<()> {
        let lock = lock_for(&self.path);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;

        let mut buffer = String::new();
        // The file may have been removed since open
        if file.metadata()?.len() == 0 {
            buffer.push_str(LOG_HEADER);
            buffer.push('\n');
        }
        buffer.push_str(&format_entry(record));
        buffer.push('\n');

        file.write_all(buffer.as_bytes())?;
        file.sync_data()?;

        debug!("Appended cost record to {}", self.path.display());
        Ok(())
    }

    pub fn sync(&self) -> io::Result<()> {
        match OpenOptions::new().append(true).open(&self.path) {
            Ok(file) => file.sync_all(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// `<file>.corrupt-<timestamp>-<suffix>`, never an existing file
fn corrupt_path(path: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d%H%M%S");
    loop {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".corrupt-{stamp}-{}", &suffix[..8]));
        let candidate = path.with_file_name(name);
        if !candidate.exists() {
            return candidate;
        }
    }
}

/// `[<timestamp>] <artifact-id> | Model: <name> | Size: <W>x<H> | Cost: $<amount> | Status: <status>`
pub fn format_entry(record: &CostRecord) -> String {
    let total = record.cost + record.validation_cost;
    let cost = if record.validation_cost > 0.0 {
        format!(
            "${total:.3} (generation: ${:.3}, validation: ${:.3})",
            record.cost, record.validation_cost
        )
    } else {
        format!("${total:.3}")
    };

    format!(
        "[{}] {} | Model: {} | Size: {} | Cost: {} | Status: {}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        record.artifact_id,
        record.model,
        record.size,
        cost,
        record.status
    )
}
