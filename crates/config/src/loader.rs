use std::path::{Path, PathBuf};

use {anyhow::Context, tracing::{debug, error}};

use crate::{env_subst::substitute_env, schema::NachosConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["nachos.toml", "nachos.yaml", "nachos.yml", "nachos.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<NachosConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./nachos.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/nachos/nachos.{toml,yaml,yml,json}` (user-global)
///
/// Returns `NachosConfig::default()` if no config file is found. A file that
/// exists but cannot be read or parsed is an error.
pub fn discover_and_load() -> anyhow::Result<NachosConfig> {
    load_discovered(find_config_file().as_deref())
}

fn load_discovered(path: Option<&Path>) -> anyhow::Result<NachosConfig> {
    let Some(path) = path else {
        debug!("no config file found, using defaults");
        return Ok(NachosConfig::default());
    };
    debug!(path = %path.display(), "loading config");
    load_config(path)
        .inspect_err(|e| error!(path = %path.display(), error = %e, "invalid config file"))
        .with_context(|| format!("invalid config file {}", path.display()))
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    let local = CONFIG_FILENAMES.iter().map(PathBuf::from);
    let global = config_dir()
        .into_iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)));
    local.chain(global).find(|p| p.exists())
}

/// Returns the user-global config directory, `~/.config/nachos/`.
pub fn config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().join(".config").join("nachos"))
}

/// Parse raw config text, choosing the format from the file extension.
pub fn parse_config(raw: &str, path: &Path) -> anyhow::Result<NachosConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}
