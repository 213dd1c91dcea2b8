//! TOML configuration file parsing

use super::{validate, Config, EngineConfig};
use crate::config::cli::ReadArgs;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_str(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    validate(&config.engine).context("Invalid [engine] section")?;
    Ok(config)
}

/// Merge CLI arguments with file configuration (CLI takes precedence)
pub fn merge_cli_with_config(args: &ReadArgs, mut config: EngineConfig) -> Result<EngineConfig> {
    if let Some(capacity) = args.capacity {
        config.capacity = capacity;
    }
    if args.pollable {
        config.poll_mode = crate::engine::PollMode::Pollable;
    }
    if let Some(backend) = args.backend {
        config.backend = backend.into();
    }
    if args.direct && config.alignment.is_none() {
        config.alignment = Some(super::MIN_ALIGNMENT);
    }

    validate(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Backend, PollMode};

    #[test]
    fn test_parse_engine_section() {
        let toml = r#"
            [engine]
            capacity = 128
            poll_mode = "pollable"
            backend = "sync"
            alignment = 4096
        "#;
        let config = parse_toml_str(toml).unwrap();
        assert_eq!(config.engine.capacity, 128);
        assert_eq!(config.engine.poll_mode, PollMode::Pollable);
        assert_eq!(config.engine.backend, Backend::Sync);
        assert_eq!(config.engine.alignment, Some(4096));
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config = parse_toml_str("[engine]\ncapacity = 8\n").unwrap();
        assert_eq!(config.engine.capacity, 8);
        assert_eq!(config.engine.poll_mode, PollMode::NotPollable);
        assert_eq!(config.engine.backend, Backend::Kernel);
        assert_eq!(config.engine.alignment, None);

        let config = parse_toml_str("").unwrap();
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(parse_toml_str("[engine]\ncapacity = 0\n").is_err());
        assert!(parse_toml_str("[engine]\npoll_mode = \"sometimes\"\n").is_err());
        assert!(parse_toml_str("[engine]\nqueue_depth = 4\n").is_err());
    }

    #[test]
    fn test_parse_toml_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("engine.toml");
        std::fs::write(&path, "[engine]\ncapacity = 16\npoll_mode = \"not_pollable\"\n").unwrap();

        let config = parse_toml_file(&path).unwrap();
        assert_eq!(config.engine.capacity, 16);
        assert!(parse_toml_file(&temp_dir.path().join("missing.toml")).is_err());
    }
}
