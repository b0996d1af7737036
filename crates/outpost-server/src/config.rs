//! Server configuration loading.
//!
//! Resolution chain: CLI flag > environment variable > config file >
//! default. The config file is plain TOML deserialized straight into
//! [`OutpostConfig`] plus the database URL.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use outpost_core::config::OutpostConfig;

/// Connection URL used when nothing else names one.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost:5432/outpost";

/// The on-disk config file shape.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub database_url: Option<String>,
    #[serde(flatten)]
    pub outpost: OutpostConfig,
}

/// Fully resolved runtime configuration.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub database_url: String,
    pub outpost: OutpostConfig,
}

/// Resolve configuration from an optional file plus environment and CLI
/// overrides.
pub fn resolve(config_path: Option<&Path>, cli_db_url: Option<&str>) -> Result<ResolvedConfig> {
    let file = match config_path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file at {}", path.display()))?;
            toml::from_str::<ConfigFile>(&contents).context("failed to parse config file")?
        }
        None => ConfigFile::default(),
    };

    let mut outpost = file.outpost;
    outpost.apply_env();

    let database_url = pick_database_url(
        cli_db_url,
        std::env::var("OUTPOST_DATABASE_URL").ok(),
        file.database_url,
    );

    Ok(ResolvedConfig {
        database_url,
        outpost,
    })
}

/// Pick the database URL by precedence: flag, env var, config file,
/// built-in default.
fn pick_database_url(
    cli: Option<&str>,
    env: Option<String>,
    file: Option<String>,
) -> String {
    cli.map(str::to_owned)
        .or(env)
        .or(file)
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_url_precedence() {
        let flag = Some("postgresql://flag/db");
        let env = Some("postgresql://env/db".to_string());
        let file = Some("postgresql://file/db".to_string());

        assert_eq!(
            pick_database_url(flag, env.clone(), file.clone()),
            "postgresql://flag/db"
        );
        assert_eq!(
            pick_database_url(None, env, file.clone()),
            "postgresql://env/db"
        );
        assert_eq!(pick_database_url(None, None, file), "postgresql://file/db");
        assert_eq!(pick_database_url(None, None, None), DEFAULT_DATABASE_URL);
    }

    #[test]
    fn config_file_carries_database_url_and_outpost_sections() {
        let file: ConfigFile = toml::from_str(
            r#"
                database_url = "postgresql://db-host:5432/outpost_prod"
                artifacts_bucket = "prod-artifacts"
            "#,
        )
        .expect("should parse");
        assert_eq!(
            file.database_url.as_deref(),
            Some("postgresql://db-host:5432/outpost_prod")
        );
        assert_eq!(file.outpost.artifacts_bucket, "prod-artifacts");
    }
}
