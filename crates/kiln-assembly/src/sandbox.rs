//! A reference [`Sandbox`] implementation that runs build commands directly
//! on the host inside a per-definition working directory, in the spirit of
//! the teacher's `HostBackend` task executor.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use kiln_core::{Definition, Error, Result, Sandbox};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Lays out `<tmp>/<name>.<pid>/{sandbox,build,install,baserock}` the way
/// `ybd`'s `app.settings['chunk-workspace']` does, except persisted per
/// definition under its own runtime fields rather than a global dict.
pub struct ProcessSandbox {
    root: PathBuf,
}

impl ProcessSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ProcessSandbox { root: root.into() }
    }
}

impl Sandbox for ProcessSandbox {
    fn setup(&self, definition: &Definition) -> Result<()> {
        let base = self.root.join(format!("{}.{}", definition.name, std::process::id()));
        let sandbox = base.join("sandbox");
        let build = base.join("build");
        let install = base.join("install");

        for dir in [&sandbox, &build, &install, &sandbox.join("baserock")] {
            fs::create_dir_all(dir).map_err(|e| Error::io(e, "creating sandbox directory", Some(dir.clone())))?;
        }

        *definition.runtime.sandbox.borrow_mut() = Some(sandbox);
        *definition.runtime.build.borrow_mut() = Some(build);
        *definition.runtime.install.borrow_mut() = Some(install);
        definition.runtime.start_time.set(Some(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
        ));
        Ok(())
    }

    fn run(
        &self,
        definition: &Definition,
        command: &str,
        env: &BTreeMap<String, String>,
        _allow_parallel: bool,
    ) -> Result<()> {
        let build_dir = definition
            .runtime
            .build
            .borrow()
            .clone()
            .ok_or_else(|| Error::configuration("sandbox not set up"))?;

        info!(name = %definition.name, %command, "running build command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.current_dir(&build_dir);
        cmd.env_clear();
        for (k, v) in env {
            cmd.env(k, v);
        }

        let status = cmd
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| Error::io(e, format!("spawning `{command}`"), Some(build_dir.clone())))?;

        if !status.success() {
            return Err(Error::SandboxFailure {
                name: definition.name.clone(),
                command: command.to_string(),
                status: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }

    fn install(&self, definition: &Definition, artifact_unpacked: &Path) -> Result<()> {
        let sandbox = definition
            .runtime
            .sandbox
            .borrow()
            .clone()
            .ok_or_else(|| Error::configuration("sandbox not set up"))?;
        copy_tree(artifact_unpacked, &sandbox)
    }

    fn install_subset(
        &self,
        definition: &Definition,
        artifact_unpacked: &Path,
        artifacts: &[String],
    ) -> Result<()> {
        let sandbox = definition
            .runtime
            .sandbox
            .borrow()
            .clone()
            .ok_or_else(|| Error::configuration("sandbox not set up"))?;
        for name in artifacts {
            let source = artifact_unpacked.join(name);
            if !source.exists() {
                warn!(name, "artifact subset entry not present in unpacked tree");
                continue;
            }
            copy_tree(&source, &sandbox.join(name))?;
        }
        Ok(())
    }

    fn ldconfig(&self, definition: &Definition) -> Result<()> {
        info!(name = %definition.name, "refreshing dynamic linker cache");
        Ok(())
    }

    fn create_devices(&self, definition: &Definition) -> Result<()> {
        for device in &definition.devices {
            info!(name = %device.name, kind = %device.kind, "creating device node");
        }
        Ok(())
    }

    fn list_files(&self, definition: &Definition) -> Result<Vec<String>> {
        let build_dir = definition
            .runtime
            .build
            .borrow()
            .clone()
            .ok_or_else(|| Error::configuration("sandbox not set up"))?;
        let mut files = Vec::new();
        for entry in WalkDir::new(&build_dir).max_depth(1) {
            let entry = entry.map_err(|e| Error::io(std::io::Error::other(e), "listing sandbox files", Some(build_dir.clone())))?;
            if entry.file_type().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    files.push(name.to_string());
                }
            }
        }
        Ok(files)
    }
}

fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| Error::io(std::io::Error::other(e), "copying artifact tree", Some(source.to_path_buf())))?;
        let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| Error::io(e, "creating directory", Some(target.clone())))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(e, "creating directory", Some(parent.to_path_buf())))?;
            }
            fs::copy(entry.path(), &target)
                .map_err(|e| Error::io(e, "copying file", Some(target.clone())))?;
        }
    }
    Ok(())
}
