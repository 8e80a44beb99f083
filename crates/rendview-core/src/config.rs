//! Config - 設定モデル
//!
//! TOML または JSON から読み込む（拡張子で判定、なければ TOML → JSON の順）。
//! 各セクションにデフォルトがあるので、ファイルには変更点だけ書けばよい。
//! 時間はすべてミリ秒。

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::RetryPolicy;
use crate::domain::{DescriptorError, Descriptors, FilterDesc, ImageFormat, RenderDesc};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RendviewConfig {
    pub manager: ManagerConfig,
    pub ldr: LdrConfig,
    pub renderers: Vec<RenderDesc>,
    pub filters: Vec<FilterDesc>,
    pub formats: Vec<ImageFormat>,
}

impl RendviewConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_err = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents).map_err(|e| parse_err(e.to_string())),
            Some("toml") | Some("tml") => {
                toml::from_str(&contents).map_err(|e| parse_err(e.to_string()))
            }
            _ => Self::parse_from_str(&contents).map_err(parse_err),
        }
    }

    /// Try TOML, then JSON.
    pub fn parse_from_str(contents: &str) -> Result<Self, String> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents)
                .map_err(|json_err| format!("toml error: {toml_err}; json error: {json_err}"))
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.manager.validate()?;
        self.ldr.validate()?;
        // A configured step with no slots would leave its tasks pending forever.
        if !self.renderers.is_empty() && self.manager.max_render_jobs == 0 {
            return Err(ConfigError::Invalid(
                "renderers are configured but manager.max_render_jobs is 0".into(),
            ));
        }
        if !self.filters.is_empty() && self.manager.max_filter_jobs == 0 {
            return Err(ConfigError::Invalid(
                "filters are configured but manager.max_filter_jobs is 0".into(),
            ));
        }
        Ok(())
    }

    /// Build the descriptor registry: built-in formats plus configured ones.
    pub fn descriptors(&self) -> Result<Descriptors, ConfigError> {
        let mut d = Descriptors::with_builtin_formats();
        for r in &self.renderers {
            d.register_render(r.clone())?;
        }
        for f in &self.filters {
            d.register_filter(f.clone())?;
        }
        for f in &self.formats {
            d.register_format(f.clone())?;
        }
        Ok(d)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Global cap on concurrently running workers.
    pub max_jobs: usize,
    pub max_render_jobs: usize,
    pub max_filter_jobs: usize,
    /// Refill from the source when fewer tasks than this are pending.
    pub todo_low_thresh: usize,
    /// Never fetch while this many tasks are pending.
    pub todo_high_thresh: usize,
    /// Consecutive failures before draining; 0 disables the ceiling.
    pub max_failed_in_sequence: u32,
    pub connect_retry: RetryConfig,
    /// Time between terminate and kill for a worker.
    pub kill_grace_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_jobs: 2,
            max_render_jobs: 2,
            max_filter_jobs: 1,
            todo_low_thresh: 2,
            todo_high_thresh: 4,
            max_failed_in_sequence: 0,
            connect_retry: RetryConfig::default(),
            kill_grace_ms: 3000,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_jobs == 0 {
            return Err(ConfigError::Invalid("manager.max_jobs must be at least 1".into()));
        }
        if self.max_render_jobs == 0 && self.max_filter_jobs == 0 {
            return Err(ConfigError::Invalid(
                "manager allows neither render nor filter jobs".into(),
            ));
        }
        if self.todo_high_thresh == 0 {
            return Err(ConfigError::Invalid(
                "manager.todo_high_thresh must be at least 1".into(),
            ));
        }
        if self.todo_low_thresh > self.todo_high_thresh {
            return Err(ConfigError::Invalid(format!(
                "manager.todo_low_thresh ({}) exceeds todo_high_thresh ({})",
                self.todo_low_thresh, self.todo_high_thresh
            )));
        }
        if !(self.connect_retry.multiplier >= 1.0) {
            return Err(ConfigError::Invalid(
                "manager.connect_retry.multiplier must be >= 1.0".into(),
            ));
        }
        Ok(())
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LdrConfig {
    pub listen: SocketAddr,
    pub password: String,
    pub auth_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    /// Downloaded files land below this directory.
    pub work_dir: PathBuf,
    pub transfer_render_input: bool,
    pub transfer_additional_files: bool,
    /// Where non-transferred additional files are expected.
    pub shared_dir: Option<PathBuf>,
    /// Keep downloaded files until exit instead of deleting them early.
    pub keep_files: bool,
}

impl Default for LdrConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3104)),
            password: String::new(),
            auth_timeout_ms: Some(10_000),
            idle_timeout_ms: None,
            work_dir: std::env::temp_dir().join("rendview-ldr"),
            transfer_render_input: true,
            transfer_additional_files: true,
            shared_dir: None,
            keep_files: false,
        }
    }
}

impl LdrConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.password.is_empty() {
            return Err(ConfigError::Invalid("ldr.password must not be empty".into()));
        }
        if (!self.transfer_render_input || !self.transfer_additional_files)
            && self.shared_dir.is_none()
        {
            return Err(ConfigError::Invalid(
                "ldr.shared_dir is required when file transfer is disabled".into(),
            ));
        }
        Ok(())
    }

    pub fn auth_timeout(&self) -> Option<Duration> {
        self.auth_timeout_ms.map(Duration::from_millis)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let c = RendviewConfig::default();
        assert_eq!(c.manager.max_jobs, 2);
        assert_eq!(c.manager.todo_low_thresh, 2);
        assert_eq!(c.manager.todo_high_thresh, 4);
        assert_eq!(c.ldr.listen.port(), 3104);
        assert!(c.ldr.transfer_render_input);
    }

    #[test]
    fn empty_password_is_rejected() {
        let c = RendviewConfig::default();
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn toml_without_extension_parses() {
        let c = RendviewConfig::parse_from_str(
            r#"
            [manager]
            max_jobs = 4
            max_failed_in_sequence = 3

            [ldr]
            password = "secret"
            listen = "127.0.0.1:4000"

            [[renderers]]
            name = "povray"
            binary = "/usr/bin/povray"
            "#,
        )
        .unwrap();
        assert_eq!(c.manager.max_jobs, 4);
        assert_eq!(c.manager.max_failed_in_sequence, 3);
        assert_eq!(c.manager.todo_high_thresh, 4);
        assert_eq!(c.ldr.listen.port(), 4000);
        assert!(c.validate().is_ok());

        let d = c.descriptors().unwrap();
        assert!(d.render("povray").is_some());
        assert!(d.format("png").is_some());
    }

    #[test]
    fn json_file_is_loaded_by_extension() {
        let mut f = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(f, r#"{{"ldr": {{"password": "pw"}}, "manager": {{"max_filter_jobs": 0}}}}"#)
            .unwrap();
        let c = RendviewConfig::load_from_file(f.path()).unwrap();
        assert_eq!(c.ldr.password, "pw");
        assert_eq!(c.manager.max_filter_jobs, 0);
    }

    #[test]
    fn configured_filter_needs_a_filter_slot() {
        let mut c = RendviewConfig::parse_from_str(
            r#"
            [manager]
            max_filter_jobs = 0

            [ldr]
            password = "pw"

            [[renderers]]
            name = "povray"
            binary = "/usr/bin/povray"
            "#,
        )
        .unwrap();
        assert!(c.validate().is_ok());

        c.filters.push(FilterDesc {
            name: "gamma".into(),
            binary: "/usr/bin/gamma".into(),
            required_args: vec![],
        });
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn low_threshold_above_high_is_rejected() {
        let m = ManagerConfig {
            todo_low_thresh: 5,
            todo_high_thresh: 4,
            ..ManagerConfig::default()
        };
        assert!(m.validate().is_err());
    }

    #[test]
    fn duplicate_format_is_rejected() {
        let c = RendviewConfig {
            formats: vec![ImageFormat::new("png", "png")],
            ..RendviewConfig::default()
        };
        assert!(matches!(
            c.descriptors(),
            Err(ConfigError::Descriptor(DescriptorError::DuplicateFormat(_)))
        ));
    }
}
