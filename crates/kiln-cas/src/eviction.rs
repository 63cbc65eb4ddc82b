//! Free-space-driven eviction (spec component E). Two explicit passes over
//! `<artifacts>/` in LRU order, each protected by the current run's live-key
//! set, each stopping as soon as free space reaches `min_gigabytes`. Made
//! explicit as two named phases rather than one function invoked twice.

use std::collections::HashSet;
use std::ffi::CString;
use std::path::{Path, PathBuf};

use kiln_core::{Error, Result};
use tracing::info;

#[derive(Debug, Default, Clone, Copy)]
pub struct EvictionReport {
    pub unpacked_removed: usize,
    pub artifacts_removed: usize,
}

pub fn run(
    artifacts_root: &Path,
    tmp: &Path,
    min_gigabytes: u64,
    live_keys: &HashSet<String>,
) -> Result<EvictionReport> {
    let mut report = EvictionReport::default();

    if evict_unpacked(artifacts_root, tmp, min_gigabytes, live_keys, &mut report)? {
        return Ok(report);
    }
    if evict_artifacts(artifacts_root, tmp, min_gigabytes, live_keys, &mut report)? {
        return Ok(report);
    }

    let free = free_gigabytes(artifacts_root)?;
    if free < min_gigabytes {
        return Err(Error::DiskPressure {
            free_gb: free,
            min_gb: min_gigabytes,
        });
    }
    Ok(report)
}

/// First pass: remove `<key>.unpacked/` subdirectories not in the live-key
/// set. Returns `true` once free space reaches the threshold.
fn evict_unpacked(
    artifacts_root: &Path,
    tmp: &Path,
    min_gigabytes: u64,
    live_keys: &HashSet<String>,
    report: &mut EvictionReport,
) -> Result<bool> {
    for key in sorted_by_mtime(artifacts_root)? {
        if free_gigabytes(artifacts_root)? >= min_gigabytes {
            info!(removed = report.unpacked_removed, "enough free space after unpacked pass");
            return Ok(true);
        }
        if live_keys.contains(&key) {
            continue;
        }
        let unpacked = artifacts_root.join(&key).join(format!("{key}.unpacked"));
        if unpacked.is_dir() {
            remove_atomically(&unpacked, tmp)?;
            report.unpacked_removed += 1;
        }
    }
    Ok(free_gigabytes(artifacts_root)? >= min_gigabytes)
}

/// Second pass: remove whole `<key>/` artifact directories not in the
/// live-key set.
fn evict_artifacts(
    artifacts_root: &Path,
    tmp: &Path,
    min_gigabytes: u64,
    live_keys: &HashSet<String>,
    report: &mut EvictionReport,
) -> Result<bool> {
    for key in sorted_by_mtime(artifacts_root)? {
        if free_gigabytes(artifacts_root)? >= min_gigabytes {
            info!(removed = report.artifacts_removed, "enough free space after artifact pass");
            return Ok(true);
        }
        if live_keys.contains(&key) {
            continue;
        }
        let path = artifacts_root.join(&key);
        if path.is_dir() {
            remove_atomically(&path, tmp)?;
            report.artifacts_removed += 1;
        }
    }
    Ok(free_gigabytes(artifacts_root)? >= min_gigabytes)
}

fn sorted_by_mtime(artifacts_root: &Path) -> Result<Vec<String>> {
    if !artifacts_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries: Vec<(String, std::time::SystemTime)> = std::fs::read_dir(artifacts_root)
        .map_err(|e| Error::io(e, "listing artifacts directory", Some(artifacts_root.to_path_buf())))?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            let mtime = meta.modified().ok()?;
            Some((e.file_name().to_string_lossy().into_owned(), mtime))
        })
        .collect();
    entries.sort_by_key(|(_, mtime)| *mtime);
    Ok(entries.into_iter().map(|(name, _)| name).collect())
}

/// Moves `path` into a private tmp directory before removing it, so a
/// partially-deleted tree is never observable at its original location.
fn remove_atomically(path: &Path, tmp: &Path) -> Result<()> {
    let staging = tempfile::Builder::new()
        .prefix("evict-")
        .tempdir_in(tmp)
        .map_err(|e| Error::io(e, "creating eviction tmpdir", Some(tmp.to_path_buf())))?;
    let moved: PathBuf = staging.path().join("to-delete");
    std::fs::rename(path, &moved).map_err(|e| Error::io(e, "moving artifact aside for deletion", Some(path.to_path_buf())))?;
    std::fs::remove_dir_all(&moved).map_err(|e| Error::io(e, "removing artifact", Some(moved)))?;
    Ok(())
}

#[cfg(unix)]
fn free_gigabytes(path: &Path) -> Result<u64> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|e| Error::configuration(e.to_string()))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated path and stat is a
    // correctly-sized, zero-initialized libc::statvfs.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(Error::io(
            std::io::Error::last_os_error(),
            "statvfs",
            Some(path.to_path_buf()),
        ));
    }
    let free_bytes = stat.f_frsize as u64 * stat.f_bavail as u64;
    Ok(free_bytes / 1_000_000_000)
}

#[cfg(not(unix))]
fn free_gigabytes(_path: &Path) -> Result<u64> {
    Ok(u64::MAX)
}
