//! Configuration management for carbonloop
//!
//! Stores settings in ~/.config/carbonloop/config.toml. The API key lives in
//! the system keychain, never in the file.

use crate::llm::Model;
use crate::optimize::state::{DEFAULT_ITERATIONS, DEFAULT_MAX_ATTEMPTS};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "config.toml";
const KEYRING_SERVICE: &str = "carbonloop";
const KEYRING_USERNAME: &str = "openrouter_api_key";
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: Model,
    pub max_attempts: u32,
    /// Calls per profiler run
    pub iterations: u64,
    /// Interpreter used for tests and profiling
    pub python: PathBuf,
    pub test_timeout_secs: u64,
    pub profile_timeout_secs: u64,
    pub llm_timeout_secs: u64,
    /// Leave generated scripts on disk after the run
    pub keep_sandbox: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: Model::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            iterations: DEFAULT_ITERATIONS,
            python: PathBuf::from("python3"),
            test_timeout_secs: 60,
            profile_timeout_secs: 120,
            llm_timeout_secs: 180,
            keep_sandbox: false,
        }
    }
}

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

fn read_keyring_key() -> Result<Option<String>, keyring::Error> {
    let entry = keyring_entry()?;
    match entry.get_password() {
        Ok(key) => Ok(Some(key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err),
    }
}

fn write_keyring_key(key: &str) -> Result<(), keyring::Error> {
    let entry = keyring_entry()?;
    entry.set_password(key)
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("carbonloop"))
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join(CONFIG_FILE_NAME))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from `path`. A missing file gives defaults; an unreadable one is
    /// moved aside to `config.toml.corrupt` and defaults are used.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                tracing::warn!(
                    path = %path.display(),
                    %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<(), String> {
        let path = Self::config_path()
            .ok_or_else(|| "Could not determine config directory".to_string())?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                    tracing::warn!("Failed to set config directory permissions: {}", e);
                }
            }
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| format!("Failed to serialize config: {}", e))?;
        write_config_atomic(path, &content).map_err(|e| format!("Failed to write config: {}", e))
    }

    /// Get the OpenRouter API key (from environment or keychain)
    pub fn get_api_key() -> Option<String> {
        // Environment variable takes precedence
        if let Some(key) = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
        {
            return Some(key);
        }

        match read_keyring_key() {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(
                    %err,
                    "failed to read API key from system keychain; set {} as a workaround",
                    API_KEY_ENV
                );
                None
            }
        }
    }

    /// Store the API key in the keychain and verify it reads back.
    pub fn set_api_key(key: &str) -> Result<(), String> {
        if let Err(write_err) = write_keyring_key(key) {
            return Err(format!(
                "Failed to store API key in system keychain: {}. \
                 You can set the {} environment variable instead.",
                write_err, API_KEY_ENV
            ));
        }

        match read_keyring_key() {
            Ok(Some(stored_key)) if stored_key == key => Ok(()),
            Ok(Some(_)) => Err(format!(
                "API key verification failed: stored key doesn't match. \
                 You can set the {} environment variable instead.",
                API_KEY_ENV
            )),
            Ok(None) => Err(format!(
                "API key verification failed: key was not persisted to keychain. \
                 You can set the {} environment variable instead.",
                API_KEY_ENV
            )),
            Err(read_err) => Err(format!(
                "API key verification failed: couldn't read back from keychain ({}). \
                 You can set the {} environment variable instead.",
                read_err, API_KEY_ENV
            )),
        }
    }

    /// Validate API key format (should start with sk-)
    pub fn validate_api_key_format(key: &str) -> bool {
        key.starts_with("sk-")
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/carbonloop/config.toml".to_string())
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &Path, content: &str) -> Result<(), String> {
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| e.to_string())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            tracing::warn!("Failed to set temp config file permissions: {}", e);
        }
    }

    file.write_all(content.as_bytes())
        .map_err(|e| e.to_string())?;
    drop(file);

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.to_string());
    }
    Ok(())
}
