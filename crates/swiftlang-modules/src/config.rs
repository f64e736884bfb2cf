//! Loader configuration
//!
//! Built from defaults, overridden by a TOML file and/or the process
//! environment:
//!
//! | Variable                      | Effect                              |
//! |-------------------------------|-------------------------------------|
//! | `SWIFTLANG_LAZY_MODULES`      | set: defer archive execution        |
//! | `SWIFTLANG_MODULE_PATH`       | extra search paths (`:` separated)  |
//! | `SWIFTLANG_CACHE_DIR`         | bytecode cache directory            |
//! | `SWIFTLANG_NO_BYTECODE_CACHE` | set: skip the on-disk bytecode cache|

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Search paths probed after the configured ones
const SYSTEM_MODULE_DIR: &str = "/usr/local/lib/swiftlang/modules";

/// Configuration for a [`crate::ModuleLoader`]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Keep decoded archive chunks unexecuted until first use
    pub lazy: bool,
    /// Directories searched for modules, in order
    pub search_paths: Vec<PathBuf>,
    /// Append the built-in search paths after `search_paths`
    pub use_default_search_paths: bool,
    /// Cache compiled source on disk
    pub bytecode_cache: bool,
    /// Where compiled source is cached
    pub cache_dir: Option<PathBuf>,
    /// Project-local archive cache
    pub project_cache_dir: PathBuf,
    /// Per-user swiftlang directory (`~/.swiftlang`)
    pub user_dir: Option<PathBuf>,
    /// Source file extension
    pub source_extension: String,
    /// Compiled archive extension
    pub archive_extension: String,
    /// Bytecode file extension
    pub bytecode_extension: String,
    /// Prefix of native init symbols
    pub native_symbol_prefix: String,
    /// Prefix of the primary bytecode entry inside an archive
    pub archive_entry_prefix: String,
    /// Trim the cache to this many modules after each load
    pub max_cached_modules: Option<usize>,
    /// Consult the package system
    pub enable_packages: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let user_dir = dirs::home_dir().map(|home| home.join(".swiftlang"));
        Self {
            lazy: false,
            search_paths: Vec::new(),
            use_default_search_paths: true,
            bytecode_cache: true,
            cache_dir: user_dir.as_ref().map(|dir| dir.join("cache")),
            project_cache_dir: PathBuf::from(".cache"),
            user_dir,
            source_extension: "swift".to_string(),
            archive_extension: "swiftmodule".to_string(),
            bytecode_extension: "swiftbc".to_string(),
            native_symbol_prefix: "swiftlang".to_string(),
            archive_entry_prefix: "swift".to_string(),
            max_cached_modules: None,
            enable_packages: true,
        }
    }
}

impl LoaderConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_from(|key| std::env::var_os(key).map(|v| v.to_string_lossy().into_owned()));
        config
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if lookup("SWIFTLANG_LAZY_MODULES").is_some() {
            self.lazy = true;
        }
        if let Some(paths) = lookup("SWIFTLANG_MODULE_PATH") {
            self.search_paths.extend(
                std::env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()),
            );
        }
        if let Some(dir) = lookup("SWIFTLANG_CACHE_DIR").filter(|d| !d.is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if lookup("SWIFTLANG_NO_BYTECODE_CACHE").is_some() {
            self.bytecode_cache = false;
        }
    }

    /// Configured search paths followed by the built-in ones
    pub fn effective_search_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.search_paths.clone();
        if self.use_default_search_paths {
            let defaults = [".", "./modules", "../modules", "./src", "src", SYSTEM_MODULE_DIR];
            for default in defaults {
                let path = PathBuf::from(default);
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
            if let Some(user_dir) = &self.user_dir {
                let user_modules = user_dir.join("modules");
                if !paths.contains(&user_modules) {
                    paths.push(user_modules);
                }
            }
        }
        paths
    }

    /// Directory searched for cached archives per user
    pub fn user_cache_dir(&self) -> Option<PathBuf> {
        self.user_dir.as_ref().map(|dir| dir.join("cache"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = LoaderConfig::default();
        assert!(!config.lazy);
        assert!(config.bytecode_cache);
        assert_eq!(config.source_extension, "swift");
        assert_eq!(config.archive_extension, "swiftmodule");
        assert_eq!(config.bytecode_extension, "swiftbc");
        assert_eq!(config.native_symbol_prefix, "swiftlang");
        assert_eq!(config.project_cache_dir, PathBuf::from(".cache"));
        assert!(config.max_cached_modules.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            ("SWIFTLANG_LAZY_MODULES", "1"),
            ("SWIFTLANG_MODULE_PATH", "/opt/a:/opt/b"),
            ("SWIFTLANG_CACHE_DIR", "/tmp/swcache"),
            ("SWIFTLANG_NO_BYTECODE_CACHE", ""),
        ]);
        let mut config = LoaderConfig::default();
        config.apply_env_from(|key| vars.get(key).cloned());

        assert!(config.lazy);
        assert!(!config.bytecode_cache);
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/swcache")));
        assert_eq!(
            config.search_paths,
            vec![PathBuf::from("/opt/a"), PathBuf::from("/opt/b")]
        );
    }

    #[test]
    fn test_env_absent_keeps_defaults() {
        let mut config = LoaderConfig::default();
        config.apply_env_from(|_| None);
        assert_eq!(config, LoaderConfig::default());
    }

    #[test]
    fn test_from_toml() {
        let config = LoaderConfig::from_toml_str(
            r#"
            lazy = true
            search_paths = ["lib", "vendor"]
            use_default_search_paths = false
            max_cached_modules = 32
            "#,
        )
        .unwrap();

        assert!(config.lazy);
        assert_eq!(config.max_cached_modules, Some(32));
        assert_eq!(
            config.effective_search_paths(),
            vec![PathBuf::from("lib"), PathBuf::from("vendor")]
        );
        assert_eq!(config.source_extension, "swift");
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            LoaderConfig::from_toml_str("lazy = \"sometimes\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_default_search_paths() {
        let config = LoaderConfig {
            search_paths: vec![PathBuf::from("./modules"), PathBuf::from("/custom")],
            user_dir: Some(PathBuf::from("/home/dev/.swiftlang")),
            ..LoaderConfig::default()
        };
        let paths = config.effective_search_paths();
        assert_eq!(paths[0], PathBuf::from("./modules"));
        assert_eq!(paths[1], PathBuf::from("/custom"));
        assert_eq!(paths.iter().filter(|p| **p == PathBuf::from("./modules")).count(), 1);
        assert!(paths.contains(&PathBuf::from(SYSTEM_MODULE_DIR)));
        assert_eq!(
            paths.last(),
            Some(&PathBuf::from("/home/dev/.swiftlang/modules"))
        );
    }
}
