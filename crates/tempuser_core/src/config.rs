use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use toml::Value;

use crate::throttle::ThrottleCondition;

pub const DEFAULT_GEN_PATTERN: &str = "~$1";
pub const DEFAULT_SERIAL_PROVIDER: &str = "local";
pub const DEFAULT_SERIAL_MAPPING: &str = "readable-numeric";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct ToolConfig {
    #[serde(default)]
    pub temp_user: TempUserSection,
    #[serde(default)]
    pub throttle: ThrottleSection,
}

/// The `[temp_user]` table. Keys follow the wiki's `AutoCreateTempUser`
/// setting so an existing block can be pasted across.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TempUserSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub known: bool,
    #[serde(default = "default_actions")]
    pub actions: Vec<String>,
    #[serde(default = "default_gen_pattern")]
    pub gen_pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_pattern: Option<PatternList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_pattern: Option<String>,
    #[serde(default)]
    pub serial_provider: SerialProviderConfig,
    #[serde(default)]
    pub serial_mapping: SerialMappingConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_before_expiration_days: Option<u32>,
}

impl Default for TempUserSection {
    fn default() -> Self {
        Self {
            enabled: false,
            known: false,
            actions: default_actions(),
            gen_pattern: default_gen_pattern(),
            match_pattern: None,
            reserved_pattern: None,
            serial_provider: SerialProviderConfig::default(),
            serial_mapping: SerialMappingConfig::default(),
            expire_after_days: None,
            notify_before_expiration_days: None,
        }
    }
}

/// `matchPattern` accepts a single template or a list of them.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PatternList {
    One(String),
    Many(Vec<String>),
}

impl PatternList {
    pub fn templates(&self) -> Vec<&str> {
        match self {
            Self::One(template) => vec![template.as_str()],
            Self::Many(templates) => templates.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SerialProviderConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_num_shards")]
    pub num_shards: u32,
    #[serde(default)]
    pub use_year: bool,
    /// Type-specific keys, passed through to extension factories.
    #[serde(flatten)]
    pub options: toml::Table,
}

impl Default for SerialProviderConfig {
    fn default() -> Self {
        Self {
            kind: DEFAULT_SERIAL_PROVIDER.to_string(),
            num_shards: default_num_shards(),
            use_year: false,
            options: toml::Table::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SerialMappingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: toml::Table,
}

impl Default for SerialMappingConfig {
    fn default() -> Self {
        Self {
            kind: DEFAULT_SERIAL_MAPPING.to_string(),
            options: toml::Table::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ThrottleSection {
    #[serde(default)]
    pub account_creation: Vec<ThrottleCondition>,
    #[serde(default)]
    pub name_acquisition: Vec<ThrottleCondition>,
}

fn default_actions() -> Vec<String> {
    vec!["edit".to_string()]
}

fn default_gen_pattern() -> String {
    DEFAULT_GEN_PATTERN.to_string()
}

fn default_num_shards() -> u32 {
    1
}

impl ToolConfig {
    /// Apply `TEMPUSER_ENABLED` and `TEMPUSER_GEN_PATTERN`: env > config.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| env::var(key).ok())
    }

    pub fn with_overrides_from<F>(mut self, lookup_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup_env("TEMPUSER_ENABLED")
            && let Some(enabled) = parse_flag(&value)
        {
            self.temp_user.enabled = enabled;
        }
        if let Some(value) = lookup_env("TEMPUSER_GEN_PATTERN") {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                self.temp_user.gen_pattern = trimmed.to_string();
            }
        }
        self
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Load and parse a ToolConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ToolConfig> {
    if !config_path.exists() {
        return Ok(ToolConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ToolConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Debug, Clone, Default)]
pub struct TempUserConfigPatch {
    pub set_enabled: Option<bool>,
    pub set_gen_pattern: Option<String>,
    pub set_num_shards: Option<u32>,
}

/// Update selected keys under `[temp_user]` while preserving all other config sections.
/// Returns `true` when a write occurred.
pub fn patch_temp_user_config(config_path: &Path, patch: &TempUserConfigPatch) -> Result<bool> {
    if patch.set_enabled.is_none() && patch.set_gen_pattern.is_none() && patch.set_num_shards.is_none()
    {
        return Ok(false);
    }

    let mut root = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str::<Value>(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        Value::Table(Default::default())
    };
    let original = root.clone();

    let root_table = root.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!(
            "top-level TOML must be a table in {}",
            config_path.display()
        )
    })?;
    let section = root_table
        .entry("temp_user".to_string())
        .or_insert_with(|| Value::Table(Default::default()))
        .as_table_mut()
        .ok_or_else(|| {
            anyhow::anyhow!("[temp_user] must be a table in {}", config_path.display())
        })?;

    if let Some(enabled) = patch.set_enabled {
        section.insert("enabled".to_string(), Value::Boolean(enabled));
    }
    if let Some(pattern) = &patch.set_gen_pattern {
        if !pattern.contains("$1") {
            bail!("genPattern must contain $1: {pattern}");
        }
        section.insert("genPattern".to_string(), Value::String(pattern.clone()));
    }
    if let Some(num_shards) = patch.set_num_shards {
        let provider = section
            .entry("serialProvider".to_string())
            .or_insert_with(|| {
                let mut table = toml::map::Map::new();
                table.insert(
                    "type".to_string(),
                    Value::String(DEFAULT_SERIAL_PROVIDER.to_string()),
                );
                Value::Table(table)
            })
            .as_table_mut()
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "[temp_user.serialProvider] must be a table in {}",
                    config_path.display()
                )
            })?;
        provider.insert("numShards".to_string(), Value::Integer(i64::from(num_shards)));
    }

    if root == original {
        return Ok(false);
    }

    let parent = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", config_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let rendered = toml::to_string_pretty(&root).context("failed to serialize config TOML")?;
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}
