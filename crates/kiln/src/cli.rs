//! Command-line surface: every `§6 Configuration` key as a `clap` flag or
//! environment variable, mirroring `ybd`'s `app.config` dict.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "kiln", version, about = "Content-addressed build orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Target definition to build, relative to `--defdir`.
    #[arg(env = "KILN_TARGET")]
    pub target: Option<String>,

    /// Target architecture. Defaults to the host architecture.
    #[arg(long, env = "KILN_ARCH")]
    pub arch: Option<String>,

    /// Directory containing definition files.
    #[arg(long, env = "KILN_DEFDIR", default_value = ".")]
    pub defdir: PathBuf,

    /// Scratch space for locks, staging directories, and sandboxes.
    #[arg(long, env = "KILN_TMP")]
    pub tmp: Option<PathBuf>,

    /// Content-addressed artifact store root.
    #[arg(long, env = "KILN_ARTIFACTS")]
    pub artifacts: Option<PathBuf>,

    /// `normal`, `no-build`, or `keys-only`.
    #[arg(long, env = "KILN_MODE", default_value = "normal")]
    pub mode: String,

    /// Number of peer worker processes to fork.
    #[arg(long, env = "KILN_INSTANCES", default_value_t = 1)]
    pub instances: u32,

    /// Base URL of a KBAS remote artifact server.
    #[arg(long, env = "KILN_KBAS_URL")]
    pub kbas_url: Option<String>,

    /// Password for uploads to the KBAS remote artifact server.
    #[arg(long, env = "KILN_KBAS_PASSWORD")]
    pub kbas_password: Option<String>,

    /// Minimum free gigabytes to keep in the artifact store.
    #[arg(long, env = "KILN_MIN_GIGABYTES", default_value_t = 10)]
    pub min_gigabytes: u64,

    /// Opaque string mixed into every cache key; bump to force a rebuild.
    #[arg(long, env = "KILN_ARTIFACT_VERSION")]
    pub artifact_version: Option<String>,

    /// Verify that rebuilding produces bit-identical artifacts instead of
    /// reusing the cache.
    #[arg(long, env = "KILN_REPRODUCE")]
    pub reproduce: bool,

    /// Write resolved cache keys as JSON to this path as they're computed.
    #[arg(long, env = "KILN_CACHE_LOG")]
    pub cache_log: Option<PathBuf>,

    /// Increase log verbosity.
    #[arg(short, long, env = "KILN_LOG_VERBOSE")]
    pub log_verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Dump the resolved system-integration manifest for a target without
    /// building it.
    Manifest {
        target: String,

        /// Directory holding a checked-out source tree to guess versions
        /// from (`AC_INIT`/`AM_INIT_AUTOMAKE`). Without this the VERSION
        /// column is always empty.
        #[arg(long)]
        checkout_root: Option<PathBuf>,
    },
}
