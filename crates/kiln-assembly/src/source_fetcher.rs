//! Reference [`SourceFetcher`] backed by `gix`, grounded on the teacher's
//! pure-Rust git utilities (no shelling out to `git`).

use std::path::Path;

use gix::bstr::ByteSlice;
use kiln_core::{Error, Result, SourceFetcher};

pub struct GitSourceFetcher;

impl GitSourceFetcher {
    pub fn new() -> Self {
        GitSourceFetcher
    }

    fn open(&self, repo: &str) -> Result<gix::Repository> {
        gix::open(repo).map_err(|e| Error::configuration(format!("opening repository {repo}: {e}")))
    }
}

impl Default for GitSourceFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceFetcher for GitSourceFetcher {
    fn get_tree(&self, repo: &str, git_ref: &str) -> Result<String> {
        let repository = self.open(repo)?;
        let commit = repository
            .rev_parse_single(git_ref)
            .map_err(|e| Error::configuration(format!("resolving {git_ref} in {repo}: {e}")))?
            .object()
            .map_err(|e| Error::configuration(e.to_string()))?
            .peel_to_commit()
            .map_err(|e| Error::configuration(e.to_string()))?;
        let tree_id = commit
            .tree_id()
            .map_err(|e| Error::configuration(e.to_string()))?;
        Ok(tree_id.to_hex().to_string())
    }

    fn checkout(&self, repo: &str, git_ref: &str, destination: &Path) -> Result<()> {
        let repository = self.open(repo)?;
        let commit = repository
            .rev_parse_single(git_ref)
            .map_err(|e| Error::configuration(format!("resolving {git_ref} in {repo}: {e}")))?
            .object()
            .map_err(|e| Error::configuration(e.to_string()))?
            .peel_to_commit()
            .map_err(|e| Error::configuration(e.to_string()))?;
        let tree = commit.tree().map_err(|e| Error::configuration(e.to_string()))?;

        std::fs::create_dir_all(destination)
            .map_err(|e| Error::io(e, "creating checkout destination", Some(destination.to_path_buf())))?;
        write_tree(&tree, destination)
    }

    fn source_date_epoch(&self, repo: &str, git_ref: &str) -> Result<i64> {
        let repository = self.open(repo)?;
        let commit = repository
            .rev_parse_single(git_ref)
            .map_err(|e| Error::configuration(format!("resolving {git_ref} in {repo}: {e}")))?
            .object()
            .map_err(|e| Error::configuration(e.to_string()))?
            .peel_to_commit()
            .map_err(|e| Error::configuration(e.to_string()))?;
        let time = commit
            .time()
            .map_err(|e| Error::configuration(e.to_string()))?;
        Ok(time.seconds)
    }
}

/// Writes every entry of `tree` under `destination`, recursing into
/// `Kind::Tree` entries so nested directories are not silently dropped.
fn write_tree(tree: &gix::Tree<'_>, destination: &Path) -> Result<()> {
    for entry in tree.iter() {
        let entry = entry.map_err(|e| Error::configuration(e.to_string()))?;
        let name = entry.filename().to_str_lossy().into_owned();
        let target = destination.join(&name);
        let object = entry
            .object()
            .map_err(|e| Error::configuration(e.to_string()))?;
        match object.kind {
            gix::object::Kind::Blob => {
                std::fs::write(&target, &object.data)
                    .map_err(|e| Error::io(e, "writing checked-out file", Some(target)))?;
            }
            gix::object::Kind::Tree => {
                std::fs::create_dir_all(&target)
                    .map_err(|e| Error::io(e, "creating checked-out directory", Some(target.clone())))?;
                let sub_tree = object
                    .try_into_tree()
                    .map_err(|e| Error::configuration(e.to_string()))?;
                write_tree(&sub_tree, &target)?;
            }
            _ => {}
        }
    }
    Ok(())
}
