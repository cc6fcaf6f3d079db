//! Stage registry: loads named stages from a directory.
//!
//! Layout:
//!
//! ```text
//! <stages_dir>/deploy.toml        optional shared defaults
//! <stages_dir>/<stage>.toml       one file per stage
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::definition::StageDefinition;
use crate::error::{ConfigError, Result};
use crate::stage::{validate_stage_name, Stage};

/// File name of the shared defaults applied to every stage.
pub const SHARED_DEFAULTS_FILE: &str = "deploy.toml";

/// Reads stage definitions. Loading is a pure read: nothing is cached or
/// written.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages_dir: PathBuf,
    project_root: PathBuf,
}

impl StageRegistry {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            stages_dir: config.stages_dir.clone(),
            project_root: config.project_root.clone(),
        }
    }

    pub fn stages_dir(&self) -> &Path {
        &self.stages_dir
    }

    /// Path a stage is loaded from.
    pub fn stage_path(&self, name: &str) -> PathBuf {
        self.stages_dir.join(format!("{name}.toml"))
    }

    /// Load, merge with shared defaults and validate one stage.
    pub fn load_stage(&self, name: &str) -> Result<Stage> {
        validate_stage_name(name)?;
        let path = self.stage_path(name);
        if !path.is_file() {
            return Err(ConfigError::StageNotFound {
                stage: name.to_string(),
                path,
            });
        }

        let mut definition = read_definition(&path)?;
        if let Some(shared) = self.load_shared()? {
            definition = definition.with_defaults(shared);
        }

        let stage = Stage::from_definition(name, definition, &self.project_root)?;
        info!(
            stage = %stage.name(),
            hosts = stage.hosts().len(),
            digest = %&stage.digest()[..12],
            "stage loaded"
        );
        Ok(stage)
    }

    /// Stage names available in the directory, sorted.
    ///
    /// Names are file stems, the same names [`StageRegistry::load_stage`]
    /// accepts. A file declaring a different `name` is reported as
    /// [`ConfigError::NameMismatch`].
    pub fn list_stages(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.stages_dir).map_err(|source| ConfigError::Read {
            path: self.stages_dir.clone(),
            source,
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ConfigError::Read {
                path: self.stages_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some(SHARED_DEFAULTS_FILE) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(declared) = read_definition(&path)?.name {
                if declared != stem {
                    return Err(ConfigError::NameMismatch {
                        requested: stem.to_string(),
                        declared,
                    });
                }
            }
            names.push(stem.to_string());
        }

        names.sort();
        debug!(count = names.len(), dir = %self.stages_dir.display(), "stages listed");
        Ok(names)
    }

    fn load_shared(&self) -> Result<Option<StageDefinition>> {
        let path = self.stages_dir.join(SHARED_DEFAULTS_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let shared = read_definition(&path)?;
        if !shared.is_shareable() {
            return Err(ConfigError::InvalidSharedDefaults { path });
        }
        Ok(Some(shared))
    }
}

fn read_definition(path: &Path) -> Result<StageDefinition> {
    let src = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    StageDefinition::from_toml(&src).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> StageRegistry {
        StageRegistry::new(
            &RuntimeConfig::default()
                .with_stages_dir(dir.path())
                .with_project_root(dir.path()),
        )
    }

    fn write(dir: &TempDir, file: &str, body: &str) {
        fs::write(dir.path().join(file), body).unwrap();
    }

    #[test]
    fn test_load_stage_reads_file() {
        let dir = TempDir::new().unwrap();
        write(&dir, "staging.toml", "[roles]\nwww = [\"web1\"]\n");

        let stage = registry(&dir).load_stage("staging").unwrap();
        assert_eq!(stage.name(), "staging");
        assert_eq!(stage.hosts().len(), 1);
    }

    #[test]
    fn test_missing_stage_is_config_error() {
        let dir = TempDir::new().unwrap();
        let err = registry(&dir).load_stage("nope").unwrap_err();
        assert!(matches!(err, ConfigError::StageNotFound { .. }));
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let dir = TempDir::new().unwrap();
        write(&dir, "broken.toml", "[roles\nwww = ");
        let err = registry(&dir).load_stage("broken").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_path_like_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let err = registry(&dir).load_stage("../secrets").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStageName(_)));
    }

    #[test]
    fn test_shared_defaults_are_applied() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "deploy.toml",
            "[set]\napplication = \"merchant\"\n[[step]]\nname = \"check\"\ncommand = \"true\"\n",
        );
        write(&dir, "staging.toml", "[roles]\nwww = [\"web1\"]\n");

        let stage = registry(&dir).load_stage("staging").unwrap();
        assert_eq!(stage.options().application(), Some("merchant"));
        assert_eq!(stage.steps().len(), 1);
    }

    #[test]
    fn test_shared_defaults_cannot_declare_hosts() {
        let dir = TempDir::new().unwrap();
        write(&dir, "deploy.toml", "[roles]\nwww = [\"web1\"]\n");
        write(&dir, "staging.toml", "[roles]\nwww = [\"web1\"]\n");

        let err = registry(&dir).load_stage("staging").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSharedDefaults { .. }));
    }

    #[test]
    fn test_optional_key_resolved_once_at_load() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("config")).unwrap();
        write(
            &dir,
            "production2.toml",
            "[roles]\nwww = [\"web1\"]\n[ssh_options]\nkeys_if_exist = [\"config/deploy_id_rsa\"]\n",
        );
        let registry = registry(&dir);

        let without = registry.load_stage("production2").unwrap();
        assert!(without.ssh().identities.is_empty());

        fs::write(dir.path().join("config/deploy_id_rsa"), "KEY").unwrap();
        let with = registry.load_stage("production2").unwrap();
        assert_eq!(
            with.ssh().identities,
            vec![dir.path().join("config/deploy_id_rsa")]
        );
        // The stage loaded earlier keeps what it resolved.
        assert!(without.ssh().identities.is_empty());
    }

    #[test]
    fn test_list_stages_sorted_without_shared_file() {
        let dir = TempDir::new().unwrap();
        write(&dir, "deploy.toml", "[set]\napplication = \"x\"\n");
        write(&dir, "staging.toml", "[roles]\nwww = [\"web1\"]\n");
        write(&dir, "production2.toml", "[roles]\nwww = [\"web1\"]\n");
        write(&dir, "notes.txt", "ignored");

        let names = registry(&dir).list_stages().unwrap();
        assert_eq!(names, vec!["production2", "staging"]);
    }

    #[test]
    fn test_listed_stages_are_loadable() {
        let dir = TempDir::new().unwrap();
        write(&dir, "prod2.toml", "name = \"prod2\"\n[roles]\nwww = [\"web1\"]\n");
        write(&dir, "staging.toml", "[roles]\nwww = [\"web2\"]\n");

        let registry = registry(&dir);
        for name in registry.list_stages().unwrap() {
            registry.load_stage(&name).unwrap();
        }
    }

    #[test]
    fn test_list_stages_rejects_declared_name_other_than_file() {
        let dir = TempDir::new().unwrap();
        write(&dir, "prod2.toml", "[roles]\nwww = [\"web1\"]\n");
        write(&dir, "prod-copy.toml", "name = \"prod2\"\n[roles]\nwww = [\"web2\"]\n");

        let err = registry(&dir).list_stages().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::NameMismatch { ref requested, ref declared }
                if requested == "prod-copy" && declared == "prod2"
        ));
    }
}
