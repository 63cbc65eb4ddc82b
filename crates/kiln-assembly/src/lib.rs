//! Assembly Driver and Multi-Instance Coordinator (spec components G and
//! H), plus reference implementations of the [`Sandbox`], [`SourceFetcher`]
//! and [`MetadataWriter`] contracts `kiln-core` declares.

pub mod coordinator;
pub mod driver;
pub mod metadata;
pub mod sandbox;
pub mod source_fetcher;

pub use coordinator::fork_peers;
pub use driver::{AssemblyDriver, StepErr, StepResult};
pub use metadata::YamlMetadataWriter;
pub use sandbox::ProcessSandbox;
pub use source_fetcher::GitSourceFetcher;

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;
    use std::sync::atomic::AtomicU64;

    use kiln_cas::Store;
    use kiln_core::{Mode, Reference, Result, RunContext, SourceFetcher};
    use kiln_defs::DefinitionLoader;
    use kiln_remote::KbasClient;

    use super::*;

    struct NullFetcher;
    impl SourceFetcher for NullFetcher {
        fn get_tree(&self, _repo: &str, _git_ref: &str) -> Result<String> {
            Ok("0000000000000000000000000000000000000000".to_string())
        }
        fn checkout(&self, _repo: &str, _git_ref: &str, _destination: &std::path::Path) -> Result<()> {
            Ok(())
        }
        fn source_date_epoch(&self, _repo: &str, _git_ref: &str) -> Result<i64> {
            Ok(0)
        }
    }

    fn ctx(tmp: &std::path::Path, artifacts: &std::path::Path) -> RunContext {
        RunContext {
            arch: "x86_64".to_string(),
            target: "root".to_string(),
            defdir: tmp.to_path_buf(),
            tmp: tmp.to_path_buf(),
            artifacts: artifacts.to_path_buf(),
            mode: Mode::Normal,
            instances: 1,
            fork: 0,
            kbas_url: RefCell::new(None),
            kbas_password: None,
            min_gigabytes: 0,
            artifact_version: None,
            reproduce: false,
            cache_log: None,
            log_verbose: false,
            total: AtomicU64::new(0),
            tasks: AtomicU64::new(0),
            keys: Default::default(),
            reproduced: Default::default(),
        }
    }

    /// A standalone chunk with no build-system and no build commands builds
    /// to an empty install tree and lands in the store under a stable key.
    #[test]
    fn composing_a_leaf_chunk_populates_the_store() {
        let defs = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let sandboxes = tempfile::tempdir().unwrap();

        fs::write(
            defs.path().join("leaf.morph"),
            "name: leaf\npath: leaf.morph\nbuild-system: manual\n",
        )
        .unwrap();

        let loader = DefinitionLoader::load(defs.path()).unwrap();
        let run = ctx(tmp.path(), artifacts.path());
        let store = Store::new(artifacts.path(), tmp.path());
        let remote = KbasClient::new();
        let fetcher = NullFetcher;
        let process_sandbox = ProcessSandbox::new(sandboxes.path());
        let metadata_writer = YamlMetadataWriter::new();

        let driver = AssemblyDriver::new(
            &loader,
            &run,
            &store,
            &remote,
            &process_sandbox,
            &fetcher,
            &metadata_writer,
        );

        let key = driver.run("leaf.morph").unwrap().unwrap();
        assert!(store.get(&key).unwrap().is_some());
    }

    /// Composing the same target twice is idempotent: the second call
    /// short-circuits on the already-populated store and does not error.
    #[test]
    fn recomposing_a_cached_target_is_a_no_op() {
        let defs = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let sandboxes = tempfile::tempdir().unwrap();

        fs::write(
            defs.path().join("leaf.morph"),
            "name: leaf\npath: leaf.morph\nbuild-system: manual\n",
        )
        .unwrap();

        let loader = DefinitionLoader::load(defs.path()).unwrap();
        let run = ctx(tmp.path(), artifacts.path());
        let store = Store::new(artifacts.path(), tmp.path());
        let remote = KbasClient::new();
        let fetcher = NullFetcher;
        let process_sandbox = ProcessSandbox::new(sandboxes.path());
        let metadata_writer = YamlMetadataWriter::new();

        let driver = AssemblyDriver::new(
            &loader,
            &run,
            &store,
            &remote,
            &process_sandbox,
            &fetcher,
            &metadata_writer,
        );

        let first = driver.run("leaf.morph").unwrap().unwrap();
        let second = driver.run("leaf.morph").unwrap().unwrap();
        assert_eq!(first, second);
    }

    /// A chunk whose `arch` disagrees with the run's target arch composes
    /// to `None` rather than an error.
    #[test]
    fn arch_mismatched_target_composes_to_none() {
        let defs = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let sandboxes = tempfile::tempdir().unwrap();

        fs::write(
            defs.path().join("leaf.morph"),
            "name: leaf\npath: leaf.morph\narch: arm\n",
        )
        .unwrap();

        let loader = DefinitionLoader::load(defs.path()).unwrap();
        let run = ctx(tmp.path(), artifacts.path());
        let store = Store::new(artifacts.path(), tmp.path());
        let remote = KbasClient::new();
        let fetcher = NullFetcher;
        let process_sandbox = ProcessSandbox::new(sandboxes.path());
        let metadata_writer = YamlMetadataWriter::new();

        let driver = AssemblyDriver::new(
            &loader,
            &run,
            &store,
            &remote,
            &process_sandbox,
            &fetcher,
            &metadata_writer,
        );

        assert_eq!(driver.run("leaf.morph").unwrap(), None);
    }

    #[test]
    fn single_instance_fork_is_lead_without_forking() {
        assert_eq!(fork_peers(1).unwrap(), 0);
    }

    #[test]
    fn reference_key_matches_path_reference() {
        let r = Reference::Path("strata/core.morph".to_string());
        assert_eq!(r.key(), "strata/core.morph");
    }
}
