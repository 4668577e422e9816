//! Configuration and data directory helpers for foldersync
//!
//! Settings live under the shared config directory (~/.config/foldersync/),
//! persisted folder mirrors under the data directory
//! (~/.local/share/foldersync/ on Linux).
//!
//! Call [`init`] at application startup to bootstrap both directories.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "foldersync";

/// Initialize the config and data directories.
///
/// Returns the config directory.
pub fn init() -> Result<PathBuf> {
    ensure_data_dir()?;
    ensure_config_dir()
}

/// Get the config directory (~/.config/foldersync/)
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_DIR))
}

/// Get the data directory that holds persisted folder blocks
pub fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join(APP_DIR))
}

/// Get the path to a config file within the config directory
pub fn config_path(filename: &str) -> Option<PathBuf> {
    config_dir().map(|p| p.join(filename))
}

/// Load and parse a JSON config file from the config directory
pub fn load_json<T: DeserializeOwned>(filename: &str) -> Result<T> {
    let path = config_path(filename).context("Could not determine config directory")?;
    load_json_file(&path)
}

/// Load a JSON config file, falling back to `T::default()` when it is absent.
///
/// A file that exists but fails to parse is still an error.
pub fn load_json_or_default<T: DeserializeOwned + Default>(filename: &str) -> Result<T> {
    match config_path(filename) {
        Some(path) if path.exists() => load_json_file(&path),
        _ => Ok(T::default()),
    }
}

/// Load and parse a JSON file from an arbitrary path
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Check if a config file exists in the config directory
pub fn config_exists(filename: &str) -> bool {
    config_path(filename).is_some_and(|p| p.exists())
}

/// Ensure the config directory exists
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir().context("Could not determine config directory")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
    Ok(dir)
}

/// Ensure the data directory exists
pub fn ensure_data_dir() -> Result<PathBuf> {
    let dir = data_dir().context("Could not determine data directory")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create data directory: {}", dir.display()))?;
    Ok(dir)
}

/// Save a value as JSON to a config file in the config directory
pub fn save_json<T: serde::Serialize>(filename: &str, value: &T) -> Result<()> {
    let dir = ensure_config_dir()?;
    save_json_file(&dir.join(filename), value)
}

/// Save a value as pretty JSON to an arbitrary path (temp file + rename)
pub fn save_json_file<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, content)
        .with_context(|| format!("Failed to write config file: {}", temp_path.display()))?;
    std::fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to replace config file: {}", path.display()))?;
    Ok(())
}
