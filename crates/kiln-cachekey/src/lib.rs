//! Cache-Key Engine (spec component B): computes `definition.cache`, the
//! recursive content hash that is the single source of identity for every
//! artifact.

pub mod build_systems;

use std::cell::RefCell;
use std::collections::BTreeMap;

use kiln_core::definition::CacheState;
use kiln_core::{Definition, Error, Mode, Reference, Result, RunContext, SourceFetcher};
use kiln_defs::DefinitionLoader;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Drives `cache_key` recursion over a [`DefinitionLoader`], writing a
/// cache-log as it goes if one is configured.
pub struct CacheKeyEngine<'a> {
    loader: &'a DefinitionLoader,
    ctx: &'a RunContext,
    fetcher: &'a dyn SourceFetcher,
    cache_log: RefCell<BTreeMap<String, String>>,
}

impl<'a> CacheKeyEngine<'a> {
    pub fn new(loader: &'a DefinitionLoader, ctx: &'a RunContext, fetcher: &'a dyn SourceFetcher) -> Self {
        CacheKeyEngine {
            loader,
            ctx,
            fetcher,
            cache_log: RefCell::new(BTreeMap::new()),
        }
    }

    /// Computes the cache key of `reference`, or `None` if its `arch`
    /// disagrees with the run's target arch (the `⊥` sentinel).
    pub fn cache_key(&self, reference: &Reference) -> Result<Option<String>> {
        let definition = self.loader.get(reference)?;

        match &*definition.runtime.cache.borrow() {
            CacheState::InProgress => {
                return Err(Error::CycleDetected {
                    path: definition.path.clone(),
                });
            }
            CacheState::Computed(key) => return Ok(Some(key.clone())),
            CacheState::Unset => {}
        }

        if let Some(arch) = &definition.arch {
            if arch != &self.ctx.arch {
                return Ok(None);
            }
        }

        *definition.runtime.cache.borrow_mut() = CacheState::InProgress;

        if let Some(repo) = &definition.repo {
            if definition.runtime.tree.borrow().is_none() {
                let git_ref = definition.git_ref.as_deref().unwrap_or("master");
                let tree = self.fetcher.get_tree(repo, git_ref)?;
                *definition.runtime.tree.borrow_mut() = Some(tree);
            }
        }

        let factors = self.hash_factors(&definition)?;
        let encoded = serde_json::to_vec(&Value::Object(factors))
            .map_err(|e| Error::configuration(e.to_string()))?;

        let key = if self.ctx.mode == Mode::NoBuild {
            "no-build".to_string()
        } else {
            let digest = Sha256::digest(&encoded);
            format!("{}.{}", definition.name, hex::encode(digest))
        };

        *definition.runtime.cache.borrow_mut() = CacheState::Computed(key.clone());
        self.ctx.record_total();
        self.ctx.push_live_key(key.clone());
        debug!(name = %definition.name, cache = %key, "cache_key is");

        if let Some(log_path) = &self.ctx.cache_log {
            self.cache_log
                .borrow_mut()
                .insert(definition.name.clone(), key.clone());
            if definition.kind == kiln_core::Kind::System {
                let body = serde_json::to_string_pretty(&*self.cache_log.borrow())
                    .map_err(|e| Error::configuration(e.to_string()))?;
                std::fs::write(log_path, body)
                    .map_err(|e| Error::io(e, "writing cache-log", Some(log_path.clone())))?;
            }
        }

        Ok(Some(key))
    }

    fn hash_factors(&self, definition: &Definition) -> Result<Map<String, Value>> {
        let mut factors = Map::new();
        factors.insert("arch".to_string(), Value::String(self.ctx.arch.clone()));

        for dep in &definition.build_depends {
            let value = self.cache_key(dep)?;
            factors.insert(dep.key().to_string(), key_or_false(value));
        }

        for content in &definition.contents {
            let value = self.cache_key(content)?;
            factors.insert(content.key().to_string(), key_or_false(value));
        }

        if let Some(tree) = definition.runtime.tree.borrow().clone() {
            factors.insert("tree".to_string(), Value::String(tree));
        }
        if let Some(submodules) = &definition.submodules {
            factors.insert("submodules".to_string(), Value::String(submodules.clone()));
        }
        for (name, commands) in definition.build_steps.ordered() {
            if !commands.is_empty() {
                factors.insert(
                    name.to_string(),
                    Value::Array(commands.iter().cloned().map(Value::String).collect()),
                );
            }
        }

        if definition.kind == kiln_core::Kind::Cluster {
            for system in &definition.systems {
                self.hash_system_recursively(system, &mut factors)?;
            }
        }

        if let Some(version) = &self.ctx.artifact_version {
            factors.insert("artifact-version".to_string(), Value::String(version.clone()));
            let table = build_systems::builtin_table();
            let table_value = serde_json::to_value(
                table
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect::<BTreeMap<_, _>>(),
            )
            .map_err(|e| Error::configuration(e.to_string()))?;
            factors.insert("default-build-systems".to_string(), table_value);
        }

        Ok(factors)
    }

    fn hash_system_recursively(
        &self,
        system: &kiln_core::SystemEntry,
        factors: &mut Map<String, Value>,
    ) -> Result<()> {
        let path = system.path.clone().unwrap_or_else(|| "BROKEN".to_string());
        let value = self.cache_key(&Reference::Path(path.clone()))?;
        factors.insert(path, key_or_false(value));
        for subsystem in &system.subsystems {
            self.hash_system_recursively(subsystem, factors)?;
        }
        Ok(())
    }
}

fn key_or_false(value: Option<String>) -> Value {
    match value {
        Some(k) => Value::String(k),
        None => Value::Bool(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::Mode;
    use std::cell::RefCell as StdRefCell;
    use std::fs;
    use std::sync::atomic::AtomicU64;

    struct FixedFetcher(StdRefCell<u32>);
    impl SourceFetcher for FixedFetcher {
        fn get_tree(&self, _repo: &str, _git_ref: &str) -> Result<String> {
            *self.0.borrow_mut() += 1;
            Ok("deadbeef".to_string())
        }
        fn checkout(&self, _repo: &str, _git_ref: &str, _destination: &std::path::Path) -> Result<()> {
            Ok(())
        }
        fn source_date_epoch(&self, _repo: &str, _git_ref: &str) -> Result<i64> {
            Ok(0)
        }
    }

    fn ctx(arch: &str) -> RunContext {
        RunContext {
            arch: arch.to_string(),
            target: "root".to_string(),
            defdir: "/tmp".into(),
            tmp: "/tmp".into(),
            artifacts: "/tmp".into(),
            mode: Mode::Normal,
            instances: 1,
            fork: 0,
            kbas_url: Default::default(),
            kbas_password: None,
            min_gigabytes: 10,
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

    #[test]
    fn deterministic_and_order_invariant() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("a.morph"),
            "name: a\npath: a.morph\nbuild-depends:\n  - b.morph\n  - c.morph\n",
        )
        .unwrap();
        fs::write(dir.path().join("b.morph"), "name: b\npath: b.morph\n").unwrap();
        fs::write(dir.path().join("c.morph"), "name: c\npath: c.morph\n").unwrap();
        fs::write(
            dir.path().join("a2.morph"),
            "name: a\npath: a2.morph\nbuild-depends:\n  - c.morph\n  - b.morph\n",
        )
        .unwrap();

        let loader = DefinitionLoader::load(dir.path()).unwrap();
        let fetcher = FixedFetcher(StdRefCell::new(0));

        let run1 = ctx("x86_64");
        let engine1 = CacheKeyEngine::new(&loader, &run1, &fetcher);
        let key1 = engine1
            .cache_key(&Reference::Path("a.morph".to_string()))
            .unwrap()
            .unwrap();

        let loader2 = DefinitionLoader::load(dir.path()).unwrap();
        let run2 = ctx("x86_64");
        let engine2 = CacheKeyEngine::new(&loader2, &run2, &fetcher);
        let key2 = engine2
            .cache_key(&Reference::Path("a2.morph".to_string()))
            .unwrap()
            .unwrap();

        assert_eq!(key1, key2, "permuting equal-value deps must not change the key");
    }

    #[test]
    fn arch_mismatch_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("a.morph"),
            "name: a\npath: a.morph\narch: arm\n",
        )
        .unwrap();
        let loader = DefinitionLoader::load(dir.path()).unwrap();
        let fetcher = FixedFetcher(StdRefCell::new(0));
        let run = ctx("x86_64");
        let engine = CacheKeyEngine::new(&loader, &run, &fetcher);
        let key = engine
            .cache_key(&Reference::Path("a.morph".to_string()))
            .unwrap();
        assert_eq!(key, None);
    }

    #[test]
    fn cycle_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("a.morph"),
            "name: a\npath: a.morph\nbuild-depends:\n  - b.morph\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("b.morph"),
            "name: b\npath: b.morph\nbuild-depends:\n  - a.morph\n",
        )
        .unwrap();
        let loader = DefinitionLoader::load(dir.path()).unwrap();
        let fetcher = FixedFetcher(StdRefCell::new(0));
        let run = ctx("x86_64");
        let engine = CacheKeyEngine::new(&loader, &run, &fetcher);
        let err = engine
            .cache_key(&Reference::Path("a.morph".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::CycleDetected { .. }));
    }

    #[test]
    fn no_build_mode_substitutes_literal_key() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.morph"), "name: a\npath: a.morph\n").unwrap();
        let loader = DefinitionLoader::load(dir.path()).unwrap();
        let fetcher = FixedFetcher(StdRefCell::new(0));
        let mut run = ctx("x86_64");
        run.mode = Mode::NoBuild;
        let engine = CacheKeyEngine::new(&loader, &run, &fetcher);
        let key = engine
            .cache_key(&Reference::Path("a.morph".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(key, "no-build");
    }

    proptest::proptest! {
        /// Permuting `build-depends` under a fixed-seed shuffle must never
        /// change the resulting cache key (spec §8's determinism/order
        /// invariance, generalized beyond one hand-written permutation).
        #[test]
        fn cache_key_is_order_invariant(
            raw_deps in proptest::collection::vec(1u32..1000, 2..6),
            seed in proptest::prelude::any::<u64>(),
        ) {
            let mut deps = Vec::new();
            for d in raw_deps {
                if !deps.contains(&d) {
                    deps.push(d);
                }
            }
            if deps.len() < 2 {
                return Ok(());
            }

            let mut shuffled = deps.clone();
            let mut state = seed | 1;
            for i in (1..shuffled.len()).rev() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let j = (state as usize) % (i + 1);
                shuffled.swap(i, j);
            }

            let dir = tempfile::tempdir().unwrap();
            let mut a_body = "name: a\npath: a.morph\nbuild-depends:\n".to_string();
            for d in &deps {
                a_body.push_str(&format!("  - dep{d}.morph\n"));
            }
            fs::write(dir.path().join("a.morph"), a_body).unwrap();

            let mut a2_body = "name: a\npath: a2.morph\nbuild-depends:\n".to_string();
            for d in &shuffled {
                a2_body.push_str(&format!("  - dep{d}.morph\n"));
            }
            fs::write(dir.path().join("a2.morph"), a2_body).unwrap();

            for d in &deps {
                fs::write(
                    dir.path().join(format!("dep{d}.morph")),
                    format!("name: dep{d}\npath: dep{d}.morph\n"),
                )
                .unwrap();
            }

            let loader = DefinitionLoader::load(dir.path()).unwrap();
            let fetcher = FixedFetcher(StdRefCell::new(0));

            let run1 = ctx("x86_64");
            let engine1 = CacheKeyEngine::new(&loader, &run1, &fetcher);
            let key1 = engine1
                .cache_key(&Reference::Path("a.morph".to_string()))
                .unwrap()
                .unwrap();

            let loader2 = DefinitionLoader::load(dir.path()).unwrap();
            let run2 = ctx("x86_64");
            let engine2 = CacheKeyEngine::new(&loader2, &run2, &fetcher);
            let key2 = engine2
                .cache_key(&Reference::Path("a2.morph".to_string()))
                .unwrap()
                .unwrap();

            proptest::prop_assert_eq!(key1, key2);
        }
    }
}
