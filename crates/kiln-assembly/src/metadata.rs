//! Writes the `<sandbox>/baserock/<name>.meta` record consumed by the
//! `install_contents`/`install_dependencies` skip check and by any later
//! artifact inspection, mirroring `ybd`'s `get_metadata`/metadata files.

use std::path::Path;

use kiln_core::{Definition, Error, MetadataWriter, Result};
use serde::Serialize;

#[derive(Serialize)]
struct MetaRecord<'a> {
    name: &'a str,
    kind: kiln_core::Kind,
    cache: Option<String>,
    repo: &'a Option<String>,
    #[serde(rename = "ref")]
    git_ref: &'a Option<String>,
}

pub struct YamlMetadataWriter;

impl YamlMetadataWriter {
    pub fn new() -> Self {
        YamlMetadataWriter
    }
}

impl Default for YamlMetadataWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataWriter for YamlMetadataWriter {
    fn write_metadata(&self, definition: &Definition, sandbox_root: &Path) -> Result<()> {
        let cache = match &*definition.runtime.cache.borrow() {
            kiln_core::CacheState::Computed(key) => Some(key.clone()),
            _ => None,
        };
        let record = MetaRecord {
            name: &definition.name,
            kind: definition.kind,
            cache,
            repo: &definition.repo,
            git_ref: &definition.git_ref,
        };

        let dir = sandbox_root.join("baserock");
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(e, "creating baserock metadata directory", Some(dir.clone())))?;
        let path = dir.join(format!("{}.meta", definition.name));
        let body = serde_yaml::to_string(&record).map_err(|e| Error::configuration(e.to_string()))?;
        std::fs::write(&path, body).map_err(|e| Error::io(e, "writing metadata file", Some(path)))
    }
}
