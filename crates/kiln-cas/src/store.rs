use std::path::{Path, PathBuf};

use kiln_core::{Error, Kind, Result};
use tracing::{debug, warn};

use crate::archive;

/// What to archive for a `put`: systems hardlink their install tree into
/// their sandbox and archive the sandbox uncompressed; everything else
/// archives its install tree, gzipped.
pub enum PutSource<'a> {
    System { sandbox: &'a Path, install: &'a Path },
    Other { install: &'a Path },
}

/// Local content-addressed artifact directory. Never deletes — that's
/// `eviction`'s job.
pub struct Store {
    artifacts_root: PathBuf,
    tmp: PathBuf,
}

impl Store {
    pub fn new(artifacts_root: impl Into<PathBuf>, tmp: impl Into<PathBuf>) -> Self {
        Store {
            artifacts_root: artifacts_root.into(),
            tmp: tmp.into(),
        }
    }

    fn artifact_dir(&self, key: &str) -> PathBuf {
        self.artifacts_root.join(key)
    }

    /// Path to the archive file for `key`, whether or not it exists yet.
    pub fn artifact_path(&self, key: &str) -> PathBuf {
        self.artifact_dir(key).join(key)
    }

    /// Returns the archive path for `key` if already cached locally,
    /// lazily extracting `.unpacked/` if missing. Tolerates a racing peer
    /// extracting concurrently: the loser's temp tree is discarded.
    pub fn get(&self, key: &str) -> Result<Option<PathBuf>> {
        let dir = self.artifact_dir(key);
        if !dir.is_dir() {
            return Ok(None);
        }
        touch(&dir)?;

        let archive_path = dir.join(key);
        let unpacked = dir.join(format!("{key}.unpacked"));
        if !unpacked.is_dir() {
            let tmp_unpacked = tempfile::Builder::new()
                .prefix("unpack-")
                .tempdir_in(&self.tmp)
                .map_err(|e| Error::io(e, "creating unpack tmpdir", Some(self.tmp.clone())))?;
            archive::extract(&archive_path, tmp_unpacked.path())?;
            match std::fs::rename(tmp_unpacked.path(), &unpacked) {
                Ok(()) => {
                    std::mem::forget(tmp_unpacked);
                }
                Err(_) if unpacked.is_dir() => {
                    debug!(key, "lost unpack race, discarding our copy");
                }
                Err(e) => {
                    return Err(Error::io(e, "moving unpacked tree into place", Some(unpacked)));
                }
            }
        }
        Ok(Some(archive_path))
    }

    /// Produces a deterministic archive for `key` from `source` and moves
    /// it into the store, extracting it in place. Returns the archive path.
    /// Racing peers producing the same key: the loser's temp tree is
    /// discarded (this is acceptable, not fatal).
    pub fn put(&self, key: &str, kind: Kind, source: PutSource<'_>) -> Result<PathBuf> {
        let staging = tempfile::Builder::new()
            .prefix("cache-")
            .tempdir_in(&self.tmp)
            .map_err(|e| Error::io(e, "creating staging tmpdir", Some(self.tmp.clone())))?;
        let cachefile = staging.path().join(key);

        match (kind, &source) {
            (Kind::System, PutSource::System { sandbox, install }) => {
                archive::hardlink_all_files(install, sandbox)?;
                archive::set_mtime_recursively(sandbox)?;
                archive::write_tar(&cachefile, sandbox)?;
            }
            (_, PutSource::Other { install }) => {
                archive::set_mtime_recursively(install)?;
                archive::write_tar_gz(&cachefile, install)?;
            }
            _ => {
                return Err(Error::configuration(
                    "system kind requires PutSource::System",
                ));
            }
        }

        self.adopt(key, staging, &cachefile)
    }

    /// Moves a staging directory containing a freshly-produced archive
    /// (named `key`) into the store at `<artifacts>/<key>/`, extracting it
    /// alongside. Shared by `put` and the remote client's `try_get`.
    pub fn adopt(&self, key: &str, staging: tempfile::TempDir, cachefile: &Path) -> Result<PathBuf> {
        let unpackdir = cachefile.with_file_name(format!("{key}.unpacked"));
        std::fs::create_dir_all(&unpackdir)
            .map_err(|e| Error::io(e, "creating unpack dir", Some(unpackdir.clone())))?;
        if let Err(e) = archive::extract(cachefile, &unpackdir) {
            warn!(key, error = %e, "problem unpacking new archive, discarding");
            return Err(e);
        }

        let dest = self.artifact_dir(key);
        match std::fs::rename(staging.path(), &dest) {
            Ok(()) => {
                std::mem::forget(staging);
                Ok(dest.join(key))
            }
            Err(_) if dest.is_dir() => {
                debug!(key, "raced on this artifact, discarding our copy");
                Ok(dest.join(key))
            }
            Err(e) => Err(Error::io(e, "moving artifact into place", Some(dest))),
        }
    }

    pub fn md5_of(&self, key: &str) -> Result<String> {
        let path = self.artifact_dir(key).join(key);
        md5_file(&path)
    }
}

pub fn md5_file(path: &Path) -> Result<String> {
    use std::io::Read;
    let mut file =
        std::fs::File::open(path).map_err(|e| Error::io(e, "reading archive for checksum", Some(path.to_path_buf())))?;
    let mut context = md5::Context::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::io(e, "reading archive for checksum", Some(path.to_path_buf())))?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

fn touch(dir: &Path) -> Result<()> {
    let now = filetime::FileTime::now();
    filetime::set_file_times(dir, now, now).map_err(|e| Error::io(e, "touching artifact dir mtime", Some(dir.to_path_buf())))
}
