use crate::client::agent::AGENT_JAR_NAME;
use anyhow::{Context, Result, anyhow};
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct Assets;

impl Assets {
    /// Finds the agent jar.
    /// Searches in the same directory as the executable first, then current working directory.
    pub fn get_agent_path(configured: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = configured {
            return Self::existing(path);
        }
        Self::find_asset(AGENT_JAR_NAME).with_context(|| {
            format!(
                "Could not find {} in the executable directory or current working directory.",
                AGENT_JAR_NAME
            )
        })
    }

    /// Finds the adb binary, falling back to whatever `adb` resolves to on PATH.
    pub fn get_adb_path(configured: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = configured {
            return Self::existing(path);
        }
        #[cfg(target_os = "windows")]
        let binary_name = "adb.exe";
        #[cfg(not(target_os = "windows"))]
        let binary_name = "adb";

        Ok(Self::find_asset(binary_name).unwrap_or_else(|_| PathBuf::from(binary_name)))
    }

    fn existing(path: &Path) -> Result<PathBuf> {
        if path.exists() {
            Ok(path.to_path_buf())
        } else {
            Err(anyhow!("{} does not exist", path.display()))
        }
    }

    fn find_asset(name: &str) -> Result<PathBuf> {
        let exe_dir = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        let dirs = exe_dir.into_iter().chain(env::current_dir().ok());
        Self::find_in(dirs, name)
    }

    fn find_in(dirs: impl IntoIterator<Item = PathBuf>, name: &str) -> Result<PathBuf> {
        for dir in dirs {
            let candidate = dir.join(name);
            if candidate.exists() {
                debug!("Found asset {} at {:?}", name, candidate);
                return Ok(candidate);
            }
        }
        Err(anyhow!("Asset {} not found", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_directory_wins() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(second.path().join("agent.jar"), b"x").unwrap();
        let found = Assets::find_in(
            [first.path().to_path_buf(), second.path().to_path_buf()],
            "agent.jar",
        )
        .unwrap();
        assert_eq!(found, second.path().join("agent.jar"));

        std::fs::write(first.path().join("agent.jar"), b"x").unwrap();
        let found = Assets::find_in(
            [first.path().to_path_buf(), second.path().to_path_buf()],
            "agent.jar",
        )
        .unwrap();
        assert_eq!(found, first.path().join("agent.jar"));
    }

    #[test]
    fn test_configured_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("adb");
        assert!(Assets::get_adb_path(Some(&missing)).is_err());
        std::fs::write(&missing, b"").unwrap();
        assert_eq!(Assets::get_adb_path(Some(&missing)).unwrap(), missing);
    }
}
