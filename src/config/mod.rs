// src/config/mod.rs

//! Configuration loading: file parsing, imports, overrides, and reference
//! resolution.
//!
//! `Config::load` reads the root config file, follows `@import` directives
//! (globs allowed in the final path component), applies the optional
//! `.chariot-overrides` file, then resolves every reference and rejects
//! cycles. The returned config is the only recipe store in the engine.

mod parser;

use crate::error::{Error, Result};
use crate::recipe::{graph, Namespace, Payload, Recipe, RecipeId, SourceKind};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Filename of the per-project source overrides, looked up next to the
/// config file.
pub const OVERRIDES_FILE: &str = ".chariot-overrides";

#[derive(Debug)]
pub struct Config {
    pub recipes: Vec<Recipe>,
    index: HashMap<(Namespace, String), RecipeId>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let mut recipes = Vec::new();
        let mut in_flight = Vec::new();
        load_file(path, &mut recipes, &mut in_flight)?;

        if let Some(dir) = path.parent() {
            let overrides = dir.join(OVERRIDES_FILE);
            if overrides.exists() {
                apply_overrides(&overrides, &mut recipes)?;
            }
        }

        let index = graph::resolve(&mut recipes)?;
        graph::detect_cycles(&recipes)?;

        Ok(Config { recipes, index })
    }

    pub fn lookup(&self, namespace: Namespace, name: &str) -> Option<RecipeId> {
        self.index.get(&(namespace, name.to_string())).copied()
    }

    pub fn recipe(&self, id: RecipeId) -> &Recipe {
        &self.recipes[id]
    }
}

fn load_file(path: &Path, recipes: &mut Vec<Recipe>, in_flight: &mut Vec<PathBuf>) -> Result<()> {
    let canonical = path.canonicalize().map_err(|err| {
        Error::ConfigError(format!("failed to locate `{}`: {}", path.display(), err))
    })?;
    if in_flight.contains(&canonical) {
        return Err(Error::ConfigError(format!(
            "import cycle through `{}`",
            path.display()
        )));
    }
    in_flight.push(canonical);

    debug!("parsing {}", path.display());
    let data = fs::read_to_string(path).map_err(|err| {
        Error::ConfigError(format!("failed to read `{}`: {}", path.display(), err))
    })?;
    let parsed = parser::parse_str(&path.to_string_lossy(), &data)?;
    recipes.extend(parsed.recipes);

    let dir = path.parent().unwrap_or(Path::new("."));
    for import in parsed.imports {
        for imported in expand_import(dir, &import)? {
            load_file(&imported, recipes, in_flight)?;
        }
    }

    in_flight.pop();
    Ok(())
}

/// Resolve an `@import` path relative to the importing file. A `*` in the
/// final component globs over the directory, in sorted order.
fn expand_import(dir: &Path, import: &str) -> Result<Vec<PathBuf>> {
    let relative = Path::new(import);
    let file_pattern = match relative.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return Err(Error::ConfigError(format!("invalid import `{}`", import))),
    };

    if !file_pattern.contains('*') {
        return Ok(vec![dir.join(relative)]);
    }

    let search_dir = match relative.parent() {
        Some(parent) if parent != Path::new("") => dir.join(parent),
        _ => dir.to_path_buf(),
    };

    let mut matches = Vec::new();
    let entries = fs::read_dir(&search_dir).map_err(|err| {
        Error::ConfigError(format!(
            "failed to read import directory `{}`: {}",
            search_dir.display(),
            err
        ))
    })?;
    for entry in entries {
        let entry = entry.map_err(Error::Io)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if glob_matches(file_pattern, name) {
            matches.push(entry.path());
        }
    }
    matches.sort();

    if matches.is_empty() {
        return Err(Error::ConfigError(format!(
            "import `{}` matched no files",
            import
        )));
    }
    Ok(matches)
}

/// Minimal `*` wildcard match, enough for import globs.
fn glob_matches(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((prefix, rest)) => {
            if !name.starts_with(prefix) {
                return false;
            }
            let name = &name[prefix.len()..];
            if rest.is_empty() {
                return true;
            }
            (0..=name.len())
                .filter(|&i| name.is_char_boundary(i))
                .any(|i| glob_matches(rest, &name[i..]))
        }
    }
}

/// Apply `.chariot-overrides`: each `<source-name>: <local-path>` line turns
/// the matching source recipe into a `local` one rooted at that path.
fn apply_overrides(path: &Path, recipes: &mut [Recipe]) -> Result<()> {
    let data = fs::read_to_string(path).map_err(|err| {
        Error::ConfigError(format!("failed to read `{}`: {}", path.display(), err))
    })?;

    for (number, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (name, local) = line.split_once(':').ok_or_else(|| {
            Error::ConfigError(format!(
                "{}:{}: expected `<source-name>: <local-path>`",
                path.display(),
                number + 1
            ))
        })?;
        let name = name.trim();
        let local = local.trim();

        let mut matched = false;
        for recipe in recipes.iter_mut() {
            if recipe.namespace() != Namespace::Source || recipe.name != name {
                continue;
            }
            if let Payload::Source(spec) = &mut recipe.payload {
                info!("overriding source/{} with local path `{}`", name, local);
                spec.kind = SourceKind::Local;
                spec.url = local.to_string();
            }
            matched = true;
        }
        if !matched {
            warn!("override for unknown source `{}`", name);
        }
    }

    Ok(())
}
