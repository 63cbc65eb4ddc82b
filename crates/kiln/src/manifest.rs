//! `kiln manifest`: a tab-separated artifact/version/repository/ref table
//! for every stratum and chunk loaded, grounded on `ybd.manifest`'s
//! `ManifestGenerator`. Version guessing is best-effort: it greps a
//! checked-out tree's `configure.ac` for `AC_INIT`, the one heuristic the
//! original tool leaned on in practice.

use std::path::Path;

use kiln_core::{Definition, Kind, Result};
use kiln_defs::DefinitionLoader;

struct Row {
    name: String,
    version: String,
    repo: String,
    git_ref: String,
}

pub fn dump(loader: &DefinitionLoader, checkout_root: Option<&Path>) -> Result<String> {
    let mut strata = Vec::new();
    let mut chunks = Vec::new();

    for path in all_paths(loader) {
        let definition = loader.get_by_path(&path)?;
        let row = Row {
            name: definition.name.clone(),
            version: checkout_root
                .and_then(|root| guess_version(&definition, root))
                .unwrap_or_default(),
            repo: definition.repo.clone().unwrap_or_default(),
            git_ref: definition
                .git_ref
                .clone()
                .unwrap_or_default()
                .chars()
                .take(7)
                .collect(),
        };
        match definition.kind {
            Kind::Stratum => strata.push(row),
            Kind::Chunk => chunks.push(row),
            _ => {}
        }
    }

    strata.sort_by(|a, b| a.name.cmp(&b.name));
    chunks.sort_by(|a, b| a.name.cmp(&b.name));

    let mut out = String::from("ARTIFACT\tVERSION\tREPOSITORY\tREF\n");
    for row in strata.into_iter().chain(chunks) {
        out.push_str(&format!("{}\t{}\t{}\t{}\n", row.name, row.version, row.repo, row.git_ref));
    }
    Ok(out)
}

fn all_paths(loader: &DefinitionLoader) -> Vec<String> {
    // Walks every parsed definition rather than just those reachable from
    // one target, since the original manifest covers the whole definitions
    // tree.
    loader.paths()
}

fn guess_version(definition: &Definition, checkout_root: &Path) -> Option<String> {
    let dir = checkout_root.join(&definition.name);
    for candidate in ["configure.ac", "configure.in", "configure.ac.in", "configure.in.in"] {
        let file = dir.join(candidate);
        let Ok(data) = std::fs::read_to_string(&file) else {
            continue;
        };
        if let Some(version) = extract_ac_init(&data) {
            return Some(version);
        }
    }
    None
}

fn extract_ac_init(data: &str) -> Option<String> {
    let flattened = data.replace('\n', " ");
    for macro_name in ["AC_INIT", "AM_INIT_AUTOMAKE"] {
        let needle = format!("{macro_name}(");
        let Some(start) = flattened.find(&needle) else {
            continue;
        };
        let after = &flattened[start + needle.len()..];
        let Some(end) = after.find(')') else { continue };
        let args: Vec<&str> = after[..end].split(',').map(str::trim).collect();
        if macro_name == "AM_INIT_AUTOMAKE" && args.len() == 1 {
            continue;
        }
        let raw = if args.len() == 1 { args[0] } else { args.get(1).copied().unwrap_or("") };
        let cleaned = raw.trim_matches(|c| c == '[' || c == ']').trim();
        let version = cleaned.split_whitespace().next().unwrap_or("");
        if version.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            return Some(version.to_string());
        }
    }
    None
}
