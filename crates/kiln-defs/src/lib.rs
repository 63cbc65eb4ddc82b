//! Definition Loader (spec component A): reads a directory tree of
//! definition files into an arena, exposing read-by-reference lookup.
//! The loader is pure — it never runs commands and never touches the
//! cache.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use kiln_core::{Definition, Error, Reference, Result};
use tracing::debug;
use walkdir::WalkDir;

const RECOGNIZED_EXTENSIONS: &[&str] = &["morph", "yaml", "yml"];

/// Arena of `Definition` records keyed by canonical path. References
/// resolved through the loader are shared pointers (`Rc`) into this arena
/// rather than owning copies, so every recursive visit of the same stratum
/// observes the same runtime state (`cache`, `tree`, `tried`).
pub struct DefinitionLoader {
    root: PathBuf,
    arena: RefCell<HashMap<String, Rc<Definition>>>,
}

impl DefinitionLoader {
    /// Walks `root` and loads every recognized definition file into the
    /// arena, keyed by its path relative to `root`.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let arena = RefCell::new(HashMap::new());
        let loader = DefinitionLoader { root, arena };
        loader.scan()?;
        Ok(loader)
    }

    fn scan(&self) -> Result<()> {
        for entry in WalkDir::new(&self.root).into_iter() {
            let entry = entry.map_err(|e| {
                Error::io(
                    std::io::Error::other(e),
                    "walking definition tree",
                    Some(self.root.clone()),
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let ext = entry.path().extension().and_then(|e| e.to_str());
            if !ext.is_some_and(|e| RECOGNIZED_EXTENSIONS.contains(&e)) {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let mut definition = self.parse_file(entry.path())?;
            if definition.path.is_empty() {
                definition.path = rel.clone();
            }
            if definition.name.is_empty() {
                definition.name = Path::new(&rel)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| rel.clone());
            }
            debug!(path = %rel, kind = ?definition.kind, "loaded definition");
            self.arena.borrow_mut().insert(rel, Rc::new(definition));
        }
        Ok(())
    }

    fn parse_file(&self, path: &Path) -> Result<Definition> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::io(e, "reading definition file", Some(path.to_path_buf()))
        })?;
        serde_yaml::from_str(&text)
            .map_err(|e| Error::configuration(format!("{}: {e}", path.display())))
    }

    /// Resolves a reference, path string or inline map, to a shared
    /// definition. Unknown paths are fatal. Inline maps are inserted into
    /// the arena under their own path on first resolution so repeated
    /// visits share runtime state.
    pub fn get(&self, reference: &Reference) -> Result<Rc<Definition>> {
        match reference {
            Reference::Path(path) => self.get_by_path(path),
            Reference::Inline(boxed) => {
                let path = boxed.path.clone();
                if let Some(existing) = self.arena.borrow().get(&path) {
                    return Ok(existing.clone());
                }
                let rc = Rc::new((**boxed).clone());
                self.arena.borrow_mut().insert(path, rc.clone());
                Ok(rc)
            }
        }
    }

    pub fn get_by_path(&self, path: &str) -> Result<Rc<Definition>> {
        self.arena
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::definition_missing(path))
    }

    /// Every relative path loaded into the arena, in no particular order.
    pub fn paths(&self) -> Vec<String> {
        self.arena.borrow().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.arena.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persists resolved `tree` values for every chunk back to its
    /// definition file, so subsequent runs skip repo resolution.
    pub fn save_trees(&self) -> Result<()> {
        for (rel, definition) in self.arena.borrow().iter() {
            let Some(tree) = definition.runtime.tree.borrow().clone() else {
                continue;
            };
            if definition.repo.is_none() {
                continue;
            }
            let path = self.root.join(rel);
            let text = std::fs::read_to_string(&path)
                .map_err(|e| Error::io(e, "reading definition file", Some(path.clone())))?;
            let mut value: serde_yaml::Value = serde_yaml::from_str(&text)
                .map_err(|e| Error::configuration(format!("{}: {e}", path.display())))?;
            if let serde_yaml::Value::Mapping(map) = &mut value {
                map.insert(
                    serde_yaml::Value::String("tree".to_string()),
                    serde_yaml::Value::String(tree),
                );
            }
            let rewritten = serde_yaml::to_string(&value)
                .map_err(|e| Error::configuration(e.to_string()))?;
            std::fs::write(&path, rewritten)
                .map_err(|e| Error::io(e, "writing definition file", Some(path)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_kind_defaults_to_chunk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.morph"), "name: a\npath: a.morph\n").unwrap();
        let loader = DefinitionLoader::load(dir.path()).unwrap();
        let def = loader.get_by_path("a.morph").unwrap();
        assert_eq!(def.kind, kiln_core::Kind::Chunk);
        assert_eq!(def.build_mode.0, "staging");
    }

    #[test]
    fn missing_path_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let loader = DefinitionLoader::load(dir.path()).unwrap();
        let err = loader.get_by_path("nope.morph").unwrap_err();
        assert!(matches!(err, Error::DefinitionMissing { .. }));
    }

    #[test]
    fn bare_string_and_inline_map_references_both_resolve() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("strata")).unwrap();
        fs::write(
            dir.path().join("strata/core.morph"),
            "name: core\npath: strata/core.morph\nkind: stratum\ncontents:\n  - strata/core.morph\n",
        )
        .unwrap();
        let loader = DefinitionLoader::load(dir.path()).unwrap();
        let def = loader.get_by_path("strata/core.morph").unwrap();
        assert_eq!(def.contents.len(), 1);
        let resolved = loader.get(&def.contents[0]).unwrap();
        assert_eq!(resolved.path, "strata/core.morph");
    }
}
