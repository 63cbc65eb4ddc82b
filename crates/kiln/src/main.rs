//! `kiln` — content-addressed build orchestrator CLI.

mod cli;
mod manifest;

use std::io::Write;
use std::sync::atomic::AtomicU64;

use clap::Parser;
use kiln_assembly::{fork_peers, AssemblyDriver, GitSourceFetcher, ProcessSandbox, YamlMetadataWriter};
use kiln_cas::Store;
use kiln_core::{Error, Mode, Reference, Result, RunContext};
use kiln_defs::DefinitionLoader;
use kiln_lock::ProcessLock;
use kiln_remote::KbasClient;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = cli::Cli::parse();
    init_tracing(cli.log_verbose);

    match real_main(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("kiln: {e}");
            std::process::exit(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn real_main(cli: cli::Cli) -> Result<i32> {
    let defdir = cli.defdir.canonicalize().unwrap_or(cli.defdir.clone());
    let tmp = cli.tmp.clone().unwrap_or_else(|| std::env::temp_dir().join("kiln"));
    std::fs::create_dir_all(&tmp).map_err(|e| Error::io(e, "creating tmp directory", Some(tmp.clone())))?;
    let artifacts = cli.artifacts.clone().unwrap_or_else(|| {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("kiln")
            .join("artifacts")
    });
    std::fs::create_dir_all(&artifacts)
        .map_err(|e| Error::io(e, "creating artifacts directory", Some(artifacts.clone())))?;

    let loader = DefinitionLoader::load(&defdir)?;

    if let Some(cli::Command::Manifest { target, checkout_root }) = &cli.command {
        let _ = loader.get_by_path(target)?;
        let text = manifest::dump(&loader, checkout_root.as_deref())?;
        print!("{text}");
        return Ok(0);
    }

    let target = cli
        .target
        .clone()
        .ok_or_else(|| Error::configuration("a target definition is required"))?;

    let mode = match cli.mode.as_str() {
        "normal" => Mode::Normal,
        "no-build" => Mode::NoBuild,
        "keys-only" => Mode::KeysOnly,
        other => return Err(Error::configuration(format!("unknown mode `{other}`"))),
    };

    let arch = cli.arch.clone().unwrap_or_else(|| std::env::consts::ARCH.to_string());

    let ctx = RunContext {
        arch,
        target: target.clone(),
        defdir: defdir.clone(),
        tmp: tmp.clone(),
        artifacts: artifacts.clone(),
        mode,
        instances: cli.instances,
        fork: 0,
        kbas_url: std::cell::RefCell::new(cli.kbas_url.clone()),
        kbas_password: cli.kbas_password.clone(),
        min_gigabytes: cli.min_gigabytes,
        artifact_version: cli.artifact_version.clone(),
        reproduce: cli.reproduce,
        cache_log: cli.cache_log.clone(),
        log_verbose: cli.log_verbose,
        total: AtomicU64::new(0),
        tasks: AtomicU64::new(0),
        keys: Default::default(),
        reproduced: Default::default(),
    };

    let _process_lock = ProcessLock::acquire(&tmp)?;

    let store = Store::new(&artifacts, &tmp);
    let remote = KbasClient::new();
    let fetcher = GitSourceFetcher::new();

    let key = {
        let engine = kiln_cachekey::CacheKeyEngine::new(&loader, &ctx, &fetcher);
        engine.cache_key(&Reference::Path(target.clone()))?
    };

    let live_keys: std::collections::HashSet<String> = ctx.keys.borrow().iter().cloned().collect();
    let _ = kiln_cas::evict(&artifacts, &tmp, ctx.min_gigabytes, &live_keys);

    if ctx.total.load(std::sync::atomic::Ordering::Relaxed) == 0 {
        return Err(Error::configuration(format!(
            "no definitions found for architecture {}",
            ctx.arch
        )));
    }

    loader.save_trees()?;

    if ctx.mode == Mode::KeysOnly {
        let resolved = key.ok_or_else(|| Error::configuration("target is architecture-incompatible"))?;
        let mut file = std::fs::File::create("./ybd.result")
            .map_err(|e| Error::io(e, "writing ybd.result", Some("./ybd.result".into())))?;
        writeln!(file, "{resolved}").map_err(|e| Error::io(e, "writing ybd.result", Some("./ybd.result".into())))?;
        return Ok(0);
    }

    let fork_index = fork_peers(cli.instances)?;
    let ctx = RunContext { fork: fork_index, ..ctx };

    let sandboxes = tmp.join("sandboxes");
    std::fs::create_dir_all(&sandboxes)
        .map_err(|e| Error::io(e, "creating sandbox root", Some(sandboxes.clone())))?;
    let sandbox = ProcessSandbox::new(&sandboxes);
    let metadata_writer = YamlMetadataWriter::new();

    let driver = AssemblyDriver::new(&loader, &ctx, &store, &remote, &sandbox, &fetcher, &metadata_writer);
    driver.run(&target)?;

    if ctx.reproduce {
        let reproduced = ctx.reproduced.borrow();
        let tasks = ctx.tasks.load(std::sync::atomic::Ordering::Relaxed);
        println!("REPRODUCED: matched {} of {tasks}", reproduced.len());
        for (checksum, key) in reproduced.iter() {
            println!("{checksum} {key}");
        }
    }

    Ok(0)
}
