//! Assembly Driver (spec component G): the recursive `compose -> assemble ->
//! build` algorithm, translated from `examples/original_source/ybd/assembly.py`
//! into explicit synchronous Rust control flow. Lock contention becomes an
//! explicit [`StepErr::Retry`] return value rather than a thrown exception.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use kiln_cachekey::{build_systems, CacheKeyEngine};
use kiln_cas::{PutSource, Store};
use kiln_core::{
    BuildSteps, Definition, Error, Kind, MetadataWriter, Reference, RunContext, Sandbox,
    SourceFetcher, SystemEntry,
};
use kiln_defs::DefinitionLoader;
use kiln_lock::KeyLock;
use kiln_remote::KbasClient;
use tracing::{debug, info};

/// Contention signals bubble up as `Retry`; anything else is fatal and
/// terminates the worker, matching the error-handling design table.
#[derive(Debug)]
pub enum StepErr {
    Retry,
    Fatal(Error),
}

impl From<Error> for StepErr {
    fn from(e: Error) -> Self {
        StepErr::Fatal(e)
    }
}

pub type StepResult<T> = std::result::Result<T, StepErr>;

pub struct AssemblyDriver<'a> {
    loader: &'a DefinitionLoader,
    ctx: &'a RunContext,
    engine: CacheKeyEngine<'a>,
    store: &'a Store,
    remote: &'a KbasClient,
    sandbox: &'a dyn Sandbox,
    fetcher: &'a dyn SourceFetcher,
    metadata_writer: &'a dyn MetadataWriter,
}

impl<'a> AssemblyDriver<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        loader: &'a DefinitionLoader,
        ctx: &'a RunContext,
        store: &'a Store,
        remote: &'a KbasClient,
        sandbox: &'a dyn Sandbox,
        fetcher: &'a dyn SourceFetcher,
        metadata_writer: &'a dyn MetadataWriter,
    ) -> Self {
        AssemblyDriver {
            loader,
            ctx,
            engine: CacheKeyEngine::new(loader, ctx, fetcher),
            store,
            remote,
            sandbox,
            fetcher,
            metadata_writer,
        }
    }

    /// Runs `compose` for `target`, retrying from the root whenever a
    /// per-key lock is contended. Because cache keys are stable and the
    /// store is checked first on every recursion, re-entry is cheap and
    /// idempotent.
    pub fn run(&self, target: &str) -> kiln_core::Result<Option<String>> {
        let target_ref = Reference::Path(target.to_string());
        loop {
            match self.compose(&target_ref) {
                Ok(key) => return Ok(key),
                Err(StepErr::Retry) => {
                    debug!("lock contention, retrying compose from root");
                    std::thread::sleep(Duration::from_millis(200));
                }
                Err(StepErr::Fatal(e)) => return Err(e),
            }
        }
    }

    fn compose(&self, reference: &Reference) -> StepResult<Option<String>> {
        let definition = self.loader.get(reference)?;

        let Some(key) = self.engine.cache_key(reference)? else {
            return Ok(None);
        };

        if self.store.get(&key)?.is_some() {
            return Ok(Some(key));
        }

        if self.ctx.remote_readable() && !self.ctx.reproduce {
            match KeyLock::try_acquire(&self.ctx.tmp, &key)? {
                None => return Err(StepErr::Retry),
                Some(_lock) => {
                    if self
                        .remote
                        .try_get(self.ctx, self.store, &definition, &key)?
                        .is_some()
                    {
                        self.ctx.record_task();
                        return Ok(Some(key));
                    }
                }
            }
        }

        self.sandbox.setup(&definition)?;
        self.assemble(&definition)?;
        self.build(&definition, &key)?;
        Ok(Some(key))
    }

    /// Cluster-level system composition, driven only by the lead worker.
    /// `systems`/`subsystems` are never shuffled — an explicit decision
    /// about otherwise-dead code in the source (see DESIGN.md).
    fn assemble(&self, definition: &Definition) -> StepResult<()> {
        if definition.kind == Kind::Cluster && self.ctx.is_lead() {
            for system in &definition.systems {
                self.compose_system_recursively(system)?;
            }
            self.install_contents(definition)?;
        }
        Ok(())
    }

    fn compose_system_recursively(&self, system: &SystemEntry) -> StepResult<()> {
        let path = system.path.clone().unwrap_or_else(|| "BROKEN".to_string());
        self.compose(&Reference::Path(path))?;
        for subsystem in &system.subsystems {
            self.compose_system_recursively(subsystem)?;
        }
        Ok(())
    }

    fn install_contents(&self, component: &Definition) -> StepResult<()> {
        self.install_contents_list(component, &component.contents)
    }

    fn install_contents_list(&self, parent: &Definition, contents: &[Reference]) -> StepResult<()> {
        let mut items: Vec<&Reference> = contents.iter().collect();
        if parent.kind != Kind::System {
            shuffle(&mut items, self.ctx.instances);
        }

        let sandbox_path = parent
            .runtime
            .sandbox
            .borrow()
            .clone()
            .ok_or_else(|| Error::configuration("sandbox not set up"))?;

        for item in items {
            let content = self.loader.get(item)?;
            let meta_path = sandbox_path.join("baserock").join(format!("{}.meta", content.name));
            if meta_path.exists() {
                continue;
            }

            if parent.kind == Kind::System {
                let stratum = parent.strata.iter().find(|s| s.path == content.path);
                if let Some(stratum) = stratum {
                    if let Some(artifacts) = &stratum.artifacts {
                        self.compose(item)?;
                        if let Some(unpacked) = self.unpacked_path_for(item)? {
                            self.sandbox.install_subset(parent, &unpacked, artifacts)?;
                        }
                        continue;
                    }
                }
            }

            self.install_contents_list(parent, &content.contents)?;
            self.compose(item)?;
            if !content.build_mode.is_bootstrap() {
                if let Some(unpacked) = self.unpacked_path_for(item)? {
                    self.sandbox.install(parent, &unpacked)?;
                }
            }
        }
        Ok(())
    }

    fn install_dependencies(&self, component: &Definition) -> StepResult<()> {
        self.install_dependencies_list(component, &component.build_depends)
    }

    fn install_dependencies_list(&self, parent: &Definition, dependencies: &[Reference]) -> StepResult<()> {
        let mut items: Vec<&Reference> = dependencies.iter().collect();
        if parent.kind != Kind::System {
            shuffle(&mut items, self.ctx.instances);
        }

        let sandbox_path = parent
            .runtime
            .sandbox
            .borrow()
            .clone()
            .ok_or_else(|| Error::configuration("sandbox not set up"))?;

        for item in items {
            let dep = self.loader.get(item)?;
            let meta_path = sandbox_path.join("baserock").join(format!("{}.meta", dep.name));
            if meta_path.exists() {
                continue;
            }

            self.install_dependencies_list(parent, &dep.build_depends)?;

            let directly_listed = parent.build_depends.iter().any(|r| r.key() == item.key());
            if directly_listed || dep.build_mode == parent.build_mode {
                self.compose(item)?;
                if !dep.contents.is_empty() {
                    self.install_dependencies_list(parent, &dep.contents)?;
                }
                if let Some(unpacked) = self.unpacked_path_for(item)? {
                    self.sandbox.install(parent, &unpacked)?;
                }
            }
        }
        Ok(())
    }

    fn unpacked_path_for(&self, reference: &Reference) -> StepResult<Option<PathBuf>> {
        let Some(key) = self.engine.cache_key(reference)? else {
            return Ok(None);
        };
        let Some(archive) = self.store.get(&key)? else {
            return Ok(None);
        };
        Ok(Some(archive.with_file_name(format!("{key}.unpacked"))))
    }

    fn build(&self, definition: &Definition, key: &str) -> StepResult<()> {
        if self.store.get(key)?.is_some() {
            return Ok(());
        }

        let Some(_lock) = KeyLock::try_acquire(&self.ctx.tmp, key)? else {
            return Err(StepErr::Retry);
        };

        if self.store.get(key)?.is_some() {
            return Ok(());
        }

        if definition.kind == Kind::Chunk {
            self.install_dependencies(definition)?;
        }

        self.run_build(definition)?;

        let sandbox_path = definition
            .runtime
            .sandbox
            .borrow()
            .clone()
            .ok_or_else(|| Error::configuration("sandbox not set up"))?;
        self.metadata_writer.write_metadata(definition, &sandbox_path)?;

        let install_path = definition
            .runtime
            .install
            .borrow()
            .clone()
            .unwrap_or_else(|| sandbox_path.join("install"));

        let archive_path = if definition.kind == Kind::System {
            self.store
                .put(key, definition.kind, PutSource::System { sandbox: &sandbox_path, install: &install_path })?
        } else {
            self.store
                .put(key, definition.kind, PutSource::Other { install: &install_path })?
        };
        debug!(key, path = %archive_path.display(), "cached");

        self.remote.try_push(self.ctx, self.store, definition, key)?;
        Ok(())
    }

    fn run_build(&self, definition: &Definition) -> StepResult<()> {
        if self.ctx.mode == kiln_core::Mode::NoBuild {
            info!(name = %definition.name, "skipping build: artifact will be empty");
            return Ok(());
        }

        if !definition.build_mode.is_bootstrap() {
            self.sandbox.ldconfig(definition)?;
        }

        if let Some(repo) = &definition.repo {
            let git_ref = definition.git_ref.as_deref().unwrap_or("master");
            let build_dir = definition
                .runtime
                .build
                .borrow()
                .clone()
                .ok_or_else(|| Error::configuration("build dir not set up"))?;
            self.fetcher.checkout(repo, git_ref, &build_dir)?;
            let epoch = self.fetcher.source_date_epoch(repo, git_ref)?;
            definition.runtime.source_date_epoch.set(Some(epoch));
        }

        let resolved = self.get_build_commands(definition)?;
        let env_vars = self.build_env(definition);

        for (step_name, commands) in resolved.ordered() {
            for command in commands {
                self.sandbox
                    .run(definition, command, &env_vars, step_name == "build")?;
            }
        }

        if !definition.devices.is_empty() {
            self.sandbox.create_devices(definition)?;
        }
        Ok(())
    }

    /// Every non-"manual" template in `kiln_cachekey::build_systems` expands
    /// `$PREFIX`/`$DESTDIR`/`$MAKEFLAGS` verbatim; these three must always be
    /// present or configure/make/install silently target the wrong root.
    fn build_env(&self, definition: &Definition) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        if let Some(epoch) = definition.runtime.source_date_epoch.get() {
            env.insert("SOURCE_DATE_EPOCH".to_string(), epoch.to_string());
        }

        let destdir = definition
            .runtime
            .install
            .borrow()
            .clone()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        env.insert("PREFIX".to_string(), "/usr".to_string());
        env.insert("DESTDIR".to_string(), destdir);
        let jobs = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        env.insert("MAKEFLAGS".to_string(), jobs.to_string());

        env
    }

    /// Resolves build commands: systems run gathered system-integration
    /// scripts as install commands; everything else fills any unset step
    /// from its named (or autodetected) build-system.
    fn get_build_commands(&self, definition: &Definition) -> StepResult<BuildSteps> {
        if definition.kind == Kind::System {
            let mut steps = BuildSteps::default();
            steps.install = self.gather_integration_commands(definition)?;
            return Ok(steps);
        }

        let table = build_systems::builtin_table();
        let bs_name = if let Some(name) = &definition.build_system {
            name.as_str()
        } else if definition.build_steps.is_unset() {
            let files = self.sandbox.list_files(definition)?;
            build_systems::autodetect(&files).unwrap_or("manual")
        } else {
            "manual"
        };
        let defaults = table.get(bs_name).cloned().unwrap_or_default();
        Ok(fill_missing(&definition.build_steps, &defaults))
    }

    fn gather_integration_commands(&self, definition: &Definition) -> StepResult<Vec<String>> {
        let mut collected: BTreeMap<String, Vec<String>> = BTreeMap::new();
        self.gather_integration_recursively(definition, &mut collected)?;
        Ok(collected.into_values().flatten().collect())
    }

    fn gather_integration_recursively(
        &self,
        definition: &Definition,
        collected: &mut BTreeMap<String, Vec<String>>,
    ) -> StepResult<()> {
        for (product, names) in &definition.system_integration {
            for (name, commands) in names {
                collected.insert(format!("{name}-{product}"), commands.clone());
            }
        }
        for content in &definition.contents {
            let child = self.loader.get(content)?;
            self.gather_integration_recursively(&child, collected)?;
        }
        Ok(())
    }
}

fn fill_missing(explicit: &BuildSteps, defaults: &BuildSteps) -> BuildSteps {
    BuildSteps {
        pre_configure: pick(&explicit.pre_configure, &defaults.pre_configure),
        configure: pick(&explicit.configure, &defaults.configure),
        pre_build: pick(&explicit.pre_build, &defaults.pre_build),
        build: pick(&explicit.build, &defaults.build),
        pre_install: pick(&explicit.pre_install, &defaults.pre_install),
        install: pick(&explicit.install, &defaults.install),
        post_install: pick(&explicit.post_install, &defaults.post_install),
    }
}

fn pick(explicit: &[String], default: &[String]) -> Vec<String> {
    if explicit.is_empty() {
        default.to_vec()
    } else {
        explicit.to_vec()
    }
}

/// Spreads lock contention across peer instances by randomizing iteration
/// order when more than one instance is configured; otherwise preserves
/// insertion order.
fn shuffle<T>(items: &mut [T], instances: u32) {
    if instances <= 1 {
        return;
    }
    let mut state = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9E3779B97F4A7C15)
        | 1;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    for i in (1..items.len()).rev() {
        let j = (next() as usize) % (i + 1);
        items.swap(i, j);
    }
}

/// Used by unit tests to confirm the live-key set does not leak stale
/// entries between cache-key computations within a run.
pub fn live_key_set(ctx: &RunContext) -> HashSet<String> {
    ctx.keys.borrow().iter().cloned().collect()
}
