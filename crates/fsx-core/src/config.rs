use config::{Config, ConfigError, File as ConfigFile};
use serde::Deserialize;

/// Defaults shared by the CLI commands, loaded from an optional `fsx` config
/// file in the working directory.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Default index file path.
    #[serde(default = "default_index_path")]
    pub index_path: String,
    /// Maximum number of duplicate directories to report; unlimited if
    /// absent.
    #[serde(default)]
    pub max_dups: Option<usize>,
    /// Unique files that may be lost for a directory to still be reported.
    #[serde(default)]
    pub max_lost: usize,
}

fn default_index_path() -> String {
    "index.fsidx".to_string()
}

impl Default for AppConfig {
    fn default() -> AppConfig {
        AppConfig {
            index_path: default_index_path(),
            max_dups: None,
            max_lost: 0,
        }
    }
}

pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("fsx").required(false))
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg: AppConfig = Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!("index.fsidx", cfg.index_path);
        assert_eq!(None, cfg.max_dups);
        assert_eq!(0, cfg.max_lost);
    }
}
