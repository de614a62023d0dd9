use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{session::DEFAULT_CHECKPOINT_CAP, undo::DEFAULT_UNDO_CAP};

/// Config file names, first match wins.
pub const CONFIG_FILES: [&str; 2] = ["patchwright.toml", ".patchwright.toml"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config
{
    /// Checkpoints kept per session (oldest dropped first)
    pub checkpoint_cap: usize,

    /// Undo batches kept (oldest dropped first)
    pub undo_cap: usize,

    /// Character limit for disk reads served to the model
    pub read_max_chars: usize,

    /// How long a project file listing stays fresh
    pub file_list_ttl_ms: u64,

    /// Globs excluded from file listings (in addition to .gitignore)
    pub ignore_patterns: Vec<String>,
}

impl Default for Config
{
    fn default() -> Self
    {
        Self {
            checkpoint_cap: DEFAULT_CHECKPOINT_CAP,
            undo_cap: DEFAULT_UNDO_CAP,
            read_max_chars: 200_000,
            file_list_ttl_ms: 2_000,
            ignore_patterns: vec![
                "target/**".to_string(),
                "node_modules/**".to_string(),
                "dist/**".to_string(),
                "**/*.pyc".to_string(),
                "**/__pycache__/**".to_string(),
                "**/.DS_Store".to_string(),
            ],
        }
    }
}

impl Config
{
    pub fn file_list_ttl(&self) -> Duration
    {
        Duration::from_millis(self.file_list_ttl_ms)
    }
}

/// Layer the first config file found under `root` and `PATCHWRIGHT_*`
/// environment variables over the defaults (missing keys keep theirs).
pub fn load_config(root: &Path) -> Result<Config>
{
    let mut builder = config::Config::builder();

    for name in &CONFIG_FILES
    {
        let path = root.join(name);
        if path.exists()
        {
            builder = builder.add_source(config::File::from(path));
            break;
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PATCHWRIGHT")
            .prefix_separator("_")
            .list_separator(",")
            .with_list_parse_key("ignore_patterns")
            .try_parsing(true),
    );

    let cfg = builder
        .build()
        .context("Failed to load configuration")?;
    let parsed: Config = cfg
        .try_deserialize()
        .context("Failed to parse configuration")?;

    Ok(parsed)
}

/// Write a default `patchwright.toml` into `dir`.
pub fn init(
    dir: &Path,
    force: bool,
) -> Result<PathBuf>
{
    let config_path = dir.join(CONFIG_FILES[0]);

    if config_path.exists() && !force
    {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let config = Config::default();
    let toml_string =
        toml::to_string_pretty(&config).context("Failed to serialize default config")?;

    std::fs::write(&config_path, toml_string).context("Failed to write config file")?;
    Ok(config_path)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_without_file()
    {
        let tmp = TempDir::new().unwrap();
        let cfg = load_config(tmp.path()).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.checkpoint_cap, 50);
        assert_eq!(cfg.undo_cap, 20);
    }

    #[test]
    fn file_overrides_defaults()
    {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path()
                .join(".patchwright.toml"),
            "undo_cap = 3\nignore_patterns = [\"gen/**\"]\n",
        )
        .unwrap();

        let cfg = load_config(tmp.path()).unwrap();
        assert_eq!(cfg.undo_cap, 3);
        assert_eq!(cfg.ignore_patterns, vec!["gen/**".to_string()]);
        assert_eq!(cfg.checkpoint_cap, DEFAULT_CHECKPOINT_CAP);
    }

    #[test]
    fn init_writes_loadable_file_and_refuses_overwrite()
    {
        let tmp = TempDir::new().unwrap();
        let path = init(tmp.path(), false).unwrap();
        assert!(path.ends_with("patchwright.toml"));
        assert_eq!(load_config(tmp.path()).unwrap(), Config::default());

        assert!(init(tmp.path(), false).is_err());
        assert!(init(tmp.path(), true).is_ok());
    }
}
