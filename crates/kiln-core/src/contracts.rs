//! Interfaces the core contracts out to external collaborators (§6): the
//! sandbox executor, the source-repository fetcher, and the
//! splitting/metadata writer. The core depends only on these traits;
//! concrete implementations live in `kiln-assembly` and are supplied by the
//! `kiln` binary at wiring time.

use std::collections::BTreeMap;
use std::path::Path;

use crate::{Definition, Result};

/// Process isolation primitive the assembly driver invokes build commands
/// through. Out of scope for this specification beyond this contract.
pub trait Sandbox {
    /// Prepares an isolated working tree for `definition`, returning its
    /// root. Called once before `assemble`/`build` recurse into it.
    fn setup(&self, definition: &Definition) -> Result<()>;

    /// Runs one build-step command inside the sandbox.
    fn run(
        &self,
        definition: &Definition,
        command: &str,
        env: &BTreeMap<String, String>,
        allow_parallel: bool,
    ) -> Result<()>;

    /// Installs a previously-built artifact's unpacked tree into this
    /// sandbox.
    fn install(&self, definition: &Definition, artifact_unpacked: &Path) -> Result<()>;

    /// Installs only the named sub-artifacts of a stratum's unpacked tree
    /// (the `strata[].artifacts` subset selector for system parents).
    fn install_subset(
        &self,
        definition: &Definition,
        artifact_unpacked: &Path,
        artifacts: &[String],
    ) -> Result<()>;

    /// Regenerates the dynamic linker cache inside the sandbox.
    fn ldconfig(&self, definition: &Definition) -> Result<()>;

    /// Creates device nodes described by `definition.devices`.
    fn create_devices(&self, definition: &Definition) -> Result<()>;

    /// Lists files present in the sandbox, used for build-system
    /// autodetection.
    fn list_files(&self, definition: &Definition) -> Result<Vec<String>>;
}

/// Git-like source-repository fetcher.
pub trait SourceFetcher {
    /// Resolves the content hash of the source tree at `repo`/`git_ref`
    /// without necessarily checking it out.
    fn get_tree(&self, repo: &str, git_ref: &str) -> Result<String>;

    /// Checks out `repo`/`git_ref` into `destination`.
    fn checkout(&self, repo: &str, git_ref: &str, destination: &Path) -> Result<()>;

    /// Commit timestamp of `git_ref`, used to seed `SOURCE_DATE_EPOCH`.
    fn source_date_epoch(&self, repo: &str, git_ref: &str) -> Result<i64>;
}

/// Writes the splitting/metadata record consumed by `get_metadata` once an
/// artifact is installed.
pub trait MetadataWriter {
    fn write_metadata(&self, definition: &Definition, sandbox_root: &Path) -> Result<()>;
}
