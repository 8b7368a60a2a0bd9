use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use toml::map::Entry;
use tracing::{debug, info, warn};

use crate::decoration::SolidDecoration;
use crate::output::{SchedulerConfig, DEFAULT_REFRESH_MHZ};
use crate::scene::SceneConfig;
use crate::shadow::ShadowSource;

pub const ENV_EXPLICIT_SYNC: &str = "LUMEN_EXPLICIT_SYNC";
pub const ENV_COMPOSE: &str = "LUMEN_COMPOSE";
pub const ENV_FORCE_SW_CURSOR: &str = "LUMEN_FORCE_SW_CURSOR";

/// Longest the compositor may wait before painting queued repaints.
pub const MAX_DELAY_LIMIT_MS: u64 = 250;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Preferred compositing backend; others are tried when it fails.
    pub backend: Option<String>,
    pub explicit_sync: bool,
    pub software_cursor: bool,
    pub max_delay_ms: u64,
    pub hw_margin_divisor: u32,
    pub paint_period_frames: u32,
    pub fence_timeout_ms: u64,
    pub reset_timeout_ms: u64,
    /// Used for outputs that report no refresh rate, in mHz.
    pub default_refresh_mhz: u32,
    pub background: [f32; 4],
    #[serde(default)]
    pub shadow: ShadowConfig,
    #[serde(default)]
    pub decoration: DecorationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: None,
            explicit_sync: true,
            software_cursor: false,
            max_delay_ms: MAX_DELAY_LIMIT_MS,
            hw_margin_divisor: 10,
            paint_period_frames: 100,
            fence_timeout_ms: 1000,
            reset_timeout_ms: 10_000,
            default_refresh_mhz: DEFAULT_REFRESH_MHZ,
            background: [0.0, 0.0, 0.0, 1.0],
            shadow: ShadowConfig::default(),
            decoration: DecorationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowConfig {
    #[serde(default = "default_shadow_enabled")]
    pub enabled: bool,
    /// Blur radius in logical pixels
    #[serde(default = "default_shadow_radius")]
    pub radius: u32,
    #[serde(default = "default_shadow_color")]
    pub color: [u8; 4],
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: default_shadow_enabled(),
            radius: default_shadow_radius(),
            color: default_shadow_color(),
        }
    }
}

fn default_shadow_enabled() -> bool {
    true
}

fn default_shadow_radius() -> u32 {
    16
}

fn default_shadow_color() -> [u8; 4] {
    [0, 0, 0, 96]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecorationConfig {
    #[serde(default = "default_decoration_color")]
    pub color: [u8; 4],
}

impl Default for DecorationConfig {
    fn default() -> Self {
        Self {
            color: default_decoration_color(),
        }
    }
}

fn default_decoration_color() -> [u8; 4] {
    [0x2e, 0x2e, 0x3a, 0xff]
}

impl Config {
    /// Loads the layered configuration from the standard locations and
    /// applies the environment toggles.
    pub fn load() -> Self {
        let backend = std::env::var(ENV_COMPOSE).ok();
        let config = Self::load_from(&layer_paths(backend.as_deref()));
        info!(
            backend = config.backend.as_deref().unwrap_or("auto"),
            explicit_sync = config.explicit_sync,
            "Config initialized"
        );
        config
    }

    /// Merges `paths` in order, later files overriding earlier ones key by key.
    pub fn load_from(paths: &[PathBuf]) -> Self {
        let mut merged = match toml::Value::try_from(Self::default()) {
            Ok(value) => value,
            Err(err) => {
                warn!("Failed to serialize the default config: {err}");
                return Self::default().with_env();
            }
        };

        let mut found_any_config = false;
        for path in paths {
            match read_layer(path) {
                Ok(Some(value)) => {
                    merge_value(&mut merged, value);
                    found_any_config = true;
                    info!("Loaded config from {}", path.display());
                }
                Ok(None) => debug!("No config at {}", path.display()),
                Err(err) => warn!("{err}"),
            }
        }
        if !found_any_config {
            debug!("No configuration file found, using default config");
        }

        let config: Config = merged.try_into().unwrap_or_else(|err| {
            warn!("Falling back to default config due to invalid overrides: {err}");
            Self::default()
        });
        config.with_env().sanitized()
    }

    /// Applies the `LUMEN_*` environment toggles.
    pub fn with_env(mut self) -> Self {
        if let Ok(value) = std::env::var(ENV_EXPLICIT_SYNC) {
            self.explicit_sync = parse_toggle(&value);
        }
        if let Ok(value) = std::env::var(ENV_FORCE_SW_CURSOR) {
            self.software_cursor = parse_toggle(&value);
        }
        if let Ok(value) = std::env::var(ENV_COMPOSE) {
            if !value.is_empty() {
                self.backend = Some(value);
            }
        }
        self
    }

    fn sanitized(mut self) -> Self {
        if self.max_delay_ms > MAX_DELAY_LIMIT_MS {
            warn!(
                "max_delay_ms {} exceeds {MAX_DELAY_LIMIT_MS}, clamping",
                self.max_delay_ms
            );
            self.max_delay_ms = MAX_DELAY_LIMIT_MS;
        }
        let defaults = Self::default();
        if self.hw_margin_divisor == 0 {
            warn!("hw_margin_divisor must not be zero");
            self.hw_margin_divisor = defaults.hw_margin_divisor;
        }
        if self.paint_period_frames == 0 {
            warn!("paint_period_frames must not be zero");
            self.paint_period_frames = defaults.paint_period_frames;
        }
        if self.default_refresh_mhz == 0 {
            self.default_refresh_mhz = defaults.default_refresh_mhz;
        }
        self
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_delay: Duration::from_millis(self.max_delay_ms),
            hw_margin_divisor: self.hw_margin_divisor,
            paint_period_frames: self.paint_period_frames,
        }
    }

    pub fn scene_config(&self) -> SceneConfig {
        SceneConfig {
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
            background: self.background,
            ..SceneConfig::default()
        }
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    /// Shadow given to undecorated-shadow windows, if shadows are enabled.
    pub fn shadow_source(&self) -> Option<ShadowSource> {
        self.shadow
            .enabled
            .then(|| ShadowSource::gradient(self.shadow.radius, self.shadow.color))
    }

    pub fn decoration_painter(&self) -> SolidDecoration {
        SolidDecoration {
            color: self.decoration.color,
        }
    }
}

fn parse_toggle(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "off" | "no" | ""
    )
}

fn read_layer(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    content
        .parse::<toml::Value>()
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn merge_value(base: &mut toml::Value, overrides: toml::Value) {
    match (base, overrides) {
        (toml::Value::Table(base_map), toml::Value::Table(override_map)) => {
            for (key, override_value) in override_map {
                match base_map.entry(key) {
                    Entry::Occupied(mut entry) => merge_value(entry.get_mut(), override_value),
                    Entry::Vacant(entry) => {
                        entry.insert(override_value);
                    }
                }
            }
        }
        (base_value, override_value) => {
            *base_value = override_value;
        }
    }
}

/// Config files in order of priority, lowest first.
pub fn layer_paths(backend: Option<&str>) -> Vec<PathBuf> {
    let mut paths = vec![get_system_config_path()];
    if let Some(user) = get_user_config_path() {
        paths.push(user);
    }
    paths.push(PathBuf::from("lumen_config.toml"));
    if let Some(backend) = backend {
        let overrides = backend_override_candidates(backend)
            .into_iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.exists());
        paths.extend(overrides);
    }
    paths
}

fn get_system_config_path() -> PathBuf {
    PathBuf::from("/etc/lumen/config.toml")
}

fn get_user_config_path() -> Option<PathBuf> {
    let config_dir = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(".config"))
        })?;
    Some(config_dir.join("lumen").join("config.toml"))
}

fn backend_override_candidates(backend: &str) -> Vec<String> {
    match backend {
        "software" => vec![
            "lumen_config.software.toml".into(),
            "lumen_config.headless.toml".into(),
        ],
        other => vec![format!("lumen_config.{other}.toml")],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;

    fn clear_env() {
        env::remove_var(ENV_EXPLICIT_SYNC);
        env::remove_var(ENV_COMPOSE);
        env::remove_var(ENV_FORCE_SW_CURSOR);
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.explicit_sync);
        assert_eq!(config.scheduler_config(), SchedulerConfig::default());
        assert_eq!(config.fence_timeout(), Duration::from_secs(1));
        assert_eq!(config.scene_config().reset_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_merge_priority() {
        let mut base =
            toml::Value::try_from(Config::default()).expect("default config is valid toml");

        let override_value: toml::Value = r#"
            max_delay_ms = 100
            [shadow]
            radius = 4
        "#
        .parse()
        .unwrap();
        merge_value(&mut base, override_value);

        let config: Config = base.try_into().unwrap();
        assert_eq!(config.max_delay_ms, 100);
        assert_eq!(config.shadow.radius, 4);
        // other keys of the table stay
        assert_eq!(config.shadow.color, default_shadow_color());
    }

    #[test]
    #[serial]
    fn test_layers_override_in_order() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let system = dir.path().join("system.toml");
        let user = dir.path().join("user.toml");
        fs::write(&system, "hw_margin_divisor = 8\npaint_period_frames = 50\n").unwrap();
        fs::write(&user, "paint_period_frames = 20\n").unwrap();

        let config = Config::load_from(&[system, user, dir.path().join("missing.toml")]);
        assert_eq!(config.hw_margin_divisor, 8);
        assert_eq!(config.paint_period_frames, 20);
    }

    #[test]
    #[serial]
    fn test_broken_layer_is_skipped() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.toml");
        let broken = dir.path().join("broken.toml");
        fs::write(&good, "fence_timeout_ms = 500\n").unwrap();
        fs::write(&broken, "fence_timeout_ms = [\n").unwrap();

        let config = Config::load_from(&[good, broken]);
        assert_eq!(config.fence_timeout_ms, 500);
    }

    #[test]
    #[serial]
    fn test_invalid_values_fall_back() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let wrong_type = dir.path().join("wrong.toml");
        fs::write(&wrong_type, "explicit_sync = \"sometimes\"\n").unwrap();
        assert_eq!(Config::load_from(&[wrong_type]), Config::default());

        let out_of_range = dir.path().join("range.toml");
        fs::write(&out_of_range, "max_delay_ms = 1000\nhw_margin_divisor = 0\n").unwrap();
        let config = Config::load_from(&[out_of_range]);
        assert_eq!(config.max_delay_ms, MAX_DELAY_LIMIT_MS);
        assert_eq!(config.hw_margin_divisor, 10);
    }

    #[test]
    #[serial]
    fn test_env_toggles() {
        clear_env();
        env::set_var(ENV_EXPLICIT_SYNC, "0");
        env::set_var(ENV_FORCE_SW_CURSOR, "1");
        env::set_var(ENV_COMPOSE, "software");

        let config = Config::load_from(&[]);
        assert!(!config.explicit_sync);
        assert!(config.software_cursor);
        assert_eq!(config.backend.as_deref(), Some("software"));
        clear_env();

        let config = Config::load_from(&[]);
        assert!(config.explicit_sync);
        assert!(!config.software_cursor);
        assert_eq!(config.backend, None);
    }

    #[test]
    #[serial]
    fn test_get_user_config_path_with_xdg_config_home() {
        let temp_dir = tempfile::tempdir().unwrap();
        let old_xdg = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", temp_dir.path());

        let path = get_user_config_path();
        assert_eq!(
            path,
            Some(temp_dir.path().join("lumen").join("config.toml"))
        );

        if let Some(old) = old_xdg {
            env::set_var("XDG_CONFIG_HOME", old);
        } else {
            env::remove_var("XDG_CONFIG_HOME");
        }
    }

    #[test]
    fn test_backend_override_candidates() {
        assert_eq!(
            backend_override_candidates("software"),
            vec!["lumen_config.software.toml", "lumen_config.headless.toml"]
        );
        assert_eq!(
            backend_override_candidates("headless"),
            vec!["lumen_config.headless.toml"]
        );
    }

    #[test]
    fn test_shadow_source_follows_toggle() {
        let mut config = Config::default();
        assert!(config.shadow_source().is_some());
        config.shadow.enabled = false;
        assert!(config.shadow_source().is_none());
    }

    #[test]
    fn test_toggle_values() {
        assert!(parse_toggle("1"));
        assert!(parse_toggle("yes"));
        assert!(!parse_toggle("0"));
        assert!(!parse_toggle("False"));
    }
}
