use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

/// Name of the dotenv file for an environment: `.env` or `.env.{name}`.
pub fn env_file_name(env: Option<&str>) -> String {
    match env {
        Some(name) => format!(".env.{}", name),
        None => ".env".to_string(),
    }
}

/// Find `file_name` in `start` or the nearest ancestor that has one.
pub fn find_in_ancestors(start: &Path, file_name: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(file_name))
        .find(|path| path.is_file())
}

/// Load the dotenv file from the current directory or any parent directory.
///
/// A missing `.env` is fine since variables may come from the process
/// environment, but a named environment (`--env staging`) must exist.
pub fn load_dotenv(env: Option<&str>) -> Result<Option<PathBuf>> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let file_name = env_file_name(env);

    let Some(path) = find_in_ancestors(&cwd, &file_name) else {
        if env.is_some() {
            anyhow::bail!(
                "No {} file found.\n\nSearched from {} to filesystem root.",
                file_name,
                cwd.display()
            );
        }
        return Ok(None);
    };

    dotenvy::from_path(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    info!(path = %path.display(), "Loaded environment file");
    Ok(Some(path))
}
