use std::path::{Path, PathBuf};

use log::warn;
use toml_edit::{DocumentMut, Item, Table};

use crate::{config::Config, error::ConfigError};

pub const CONFIG_FILE_NAME: &str = "config.toml";

/// `config.toml` under the per-user config directory, if one exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("playlist-arranger").join(CONFIG_FILE_NAME))
}

fn set_table_value_preserving_decor(table: &mut Table, key: &str, item: Item) {
    let existing_value_decor = table
        .get(key)
        .and_then(|current| current.as_value().map(|value| value.decor().clone()));
    table[key] = item;
    if let Some(existing_value_decor) = existing_value_decor {
        if let Some(next_value) = table[key].as_value_mut() {
            *next_value.decor_mut() = existing_value_decor;
        }
    }
}

fn merge_table_with_targeted_updates(destination: &mut Table, source: &Table) {
    for (key, source_item) in source.iter() {
        match source_item {
            Item::Table(source_table) => {
                if !destination.get(key).is_some_and(Item::is_table) {
                    destination.insert(key, Item::Table(Table::new()));
                }
                if let Some(destination_table) = destination.get_mut(key).and_then(Item::as_table_mut) {
                    merge_table_with_targeted_updates(destination_table, source_table);
                }
            }
            _ => set_table_value_preserving_decor(destination, key, source_item.clone()),
        }
    }
}

/// Writes `config` into `existing_text`, keeping comments and formatting of
/// untouched keys.
pub fn serialize_config_with_preserved_comments(
    existing_text: &str,
    config: &Config,
) -> Result<String, ConfigError> {
    let next_text = toml::to_string(config)?;
    let next_document = next_text.parse::<DocumentMut>()?;
    let mut existing_document = existing_text.parse::<DocumentMut>()?;

    merge_table_with_targeted_updates(existing_document.as_table_mut(), next_document.as_table());
    Ok(existing_document.to_string())
}

pub fn persist_config_file(config: &Config, path: &Path) {
    let existing_text = std::fs::read_to_string(path).ok();
    let config_text = if let Some(existing_text) = existing_text {
        match serialize_config_with_preserved_comments(&existing_text, config) {
            Ok(updated_text) => Some(updated_text),
            Err(err) => {
                warn!(
                    "Failed to preserve config comments for {} ({}). Falling back to plain serialization.",
                    path.display(),
                    err
                );
                toml::to_string(config).ok()
            }
        }
    } else {
        toml::to_string(config).ok()
    };

    let Some(config_text) = config_text else {
        log::error!("Failed to serialize config for {}", path.display());
        return;
    };

    if let Some(parent) = path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            log::error!("Failed to create config directory {}: {}", parent.display(), err);
            return;
        }
    }
    if let Err(err) = std::fs::write(path, config_text) {
        log::error!("Failed to persist config to {}: {}", path.display(), err);
    }
}

pub fn try_load_config_file(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str::<Config>(&content)?.sanitized())
}

/// Loads `path`, falling back to defaults when it is missing or invalid.
pub fn load_config_file(path: &Path) -> Config {
    match try_load_config_file(path) {
        Ok(config) => config,
        Err(ConfigError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("No config at {}; using defaults", path.display());
            Config::default()
        }
        Err(err) => {
            warn!(
                "Failed to load config file {}. Using defaults. error={}",
                path.display(),
                err
            );
            Config::default()
        }
    }
}
