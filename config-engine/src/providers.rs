use crate::{error::Result, RebacConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "REBAC_CONFIG";

/// Prefix of per-setting environment overrides.
pub const ENV_PREFIX: &str = "REBAC_";

/// The layered provider stack. A missing file contributes nothing.
pub fn figment(path: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(RebacConfig::default()));

    let path = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));
    if let Some(path) = path {
        debug!(path = %path.display(), "Reading configuration file");
        figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => figment.merge(Toml::file(path)),
            _ => figment.merge(Yaml::file(path)),
        };
    }

    figment.merge(
        Env::prefixed(ENV_PREFIX)
            .ignore(&["CONFIG"])
            .split("__"),
    )
}

impl RebacConfig {
    /// Load from `REBAC_CONFIG` (if set), `.env` and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(None::<&Path>)
    }

    /// Load with an explicit configuration file
    pub fn load_from<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        if let Ok(dotenv) = dotenvy::dotenv() {
            debug!(path = %dotenv.display(), "Loaded .env file");
        }

        let config: Self = figment(path.as_ref().map(|p| p.as_ref())).extract()?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogFormat;
    use figment::Jail;

    #[test]
    fn test_defaults_without_sources() {
        Jail::expect_with(|_jail| {
            let config = RebacConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config, RebacConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_file_then_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "rebac.yaml",
                r#"
database:
  url: postgres://localhost/rebac
engine:
  max_page_size: 500
  parallel_union: false
logging:
  format: json
"#,
            )?;
            jail.set_env("REBAC_ENGINE__MAX_PAGE_SIZE", "250");

            let config = RebacConfig::load_from(Some("rebac.yaml")).map_err(|e| e.to_string())?;
            assert_eq!(config.database.url.as_deref(), Some("postgres://localhost/rebac"));
            assert_eq!(config.engine.max_page_size, 250);
            assert!(!config.engine.parallel_union);
            assert_eq!(config.engine.default_page_size, 100);
            assert_eq!(config.logging.format, LogFormat::Json);
            Ok(())
        });
    }

    #[test]
    fn test_config_path_from_env() {
        Jail::expect_with(|jail| {
            jail.create_file("settings.toml", "[engine]\nmax_schema_depth = 4\n")?;
            jail.set_env(CONFIG_PATH_ENV, "settings.toml");

            let config = RebacConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.engine.max_schema_depth, 4);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("REBAC_ENGINE__DEFAULT_PAGE_SIZE", "5000");
            assert!(RebacConfig::load().is_err());
            Ok(())
        });
    }
}
