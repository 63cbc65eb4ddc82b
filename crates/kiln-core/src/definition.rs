use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A node in the build graph. `kind` defaults to [`Kind::Chunk`] and
/// `build_mode` defaults to `"staging"` when absent from the definition
/// file, per the loader's normalization rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub kind: Kind,
    pub arch: Option<String>,

    pub repo: Option<String>,
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    #[serde(rename = "unpetrify-ref")]
    pub unpetrify_ref: Option<String>,

    #[serde(rename = "build-system")]
    pub build_system: Option<String>,
    #[serde(rename = "build-steps", default)]
    pub build_steps: BuildSteps,

    #[serde(rename = "build-depends", default)]
    pub build_depends: Vec<Reference>,
    #[serde(default)]
    pub contents: Vec<Reference>,

    #[serde(default)]
    pub systems: Vec<SystemEntry>,
    #[serde(default)]
    pub strata: Vec<StratumEntry>,

    /// `product -> name -> command sequence`.
    #[serde(rename = "system-integration", default)]
    pub system_integration: BTreeMap<String, BTreeMap<String, Vec<String>>>,

    #[serde(default)]
    pub devices: Vec<DeviceSpec>,

    #[serde(rename = "build-mode", default)]
    pub build_mode: BuildMode,

    #[serde(default)]
    pub submodules: Option<String>,

    /// Runtime-only fields. Never (de)serialized from a definition file;
    /// reset at the start of every run.
    #[serde(skip)]
    pub runtime: Runtime,
}

#[derive(Debug, Default)]
pub struct Runtime {
    pub cache: RefCell<CacheState>,
    pub tree: RefCell<Option<String>>,
    pub sandbox: RefCell<Option<PathBuf>>,
    pub build: RefCell<Option<PathBuf>>,
    pub install: RefCell<Option<PathBuf>>,
    pub log: RefCell<Option<PathBuf>>,
    pub start_time: Cell<Option<i64>>,
    pub tried: Cell<bool>,
    pub source_date_epoch: Cell<Option<i64>>,
}

/// Replaces the source's stringly-typed `"calculating"` sentinel. Cycle
/// detection is the transition `InProgress -> InProgress`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CacheState {
    #[default]
    Unset,
    InProgress,
    Computed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Cluster,
    System,
    Stratum,
    #[default]
    Chunk,
}

/// Open-ended per spec ("staging, bootstrap, ..."); compared for equality
/// only, so a thin wrapper is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildMode(pub String);

impl Default for BuildMode {
    fn default() -> Self {
        BuildMode("staging".to_string())
    }
}

impl BuildMode {
    pub fn is_bootstrap(&self) -> bool {
        self.0 == "bootstrap"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSteps {
    #[serde(rename = "pre-configure-commands", default)]
    pub pre_configure: Vec<String>,
    #[serde(rename = "configure-commands", default)]
    pub configure: Vec<String>,
    #[serde(rename = "pre-build-commands", default)]
    pub pre_build: Vec<String>,
    #[serde(rename = "build-commands", default)]
    pub build: Vec<String>,
    #[serde(rename = "pre-install-commands", default)]
    pub pre_install: Vec<String>,
    #[serde(rename = "install-commands", default)]
    pub install: Vec<String>,
    #[serde(rename = "post-install-commands", default)]
    pub post_install: Vec<String>,
}

impl BuildSteps {
    /// Fixed step order mandated by the assembly driver.
    pub fn ordered(&self) -> [(&'static str, &[String]); 7] {
        [
            ("pre-configure", &self.pre_configure),
            ("configure", &self.configure),
            ("pre-build", &self.pre_build),
            ("build", &self.build),
            ("pre-install", &self.pre_install),
            ("install", &self.install),
            ("post-install", &self.post_install),
        ]
    }

    pub fn is_unset(&self) -> bool {
        self.pre_configure.is_empty()
            && self.configure.is_empty()
            && self.pre_build.is_empty()
            && self.build.is_empty()
            && self.pre_install.is_empty()
            && self.install.is_empty()
            && self.post_install.is_empty()
    }
}

/// A reference to another definition: either a bare path string, or an
/// inline map returned as-is (cluster system entries).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reference {
    Path(String),
    Inline(Box<Definition>),
}

impl Reference {
    pub fn key(&self) -> &str {
        match self {
            Reference::Path(p) => p,
            Reference::Inline(d) => &d.path,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEntry {
    pub path: Option<String>,
    #[serde(default)]
    pub subsystems: Vec<SystemEntry>,
    pub deploy: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumEntry {
    pub path: String,
    pub artifacts: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub major: u32,
    pub minor: u32,
}
