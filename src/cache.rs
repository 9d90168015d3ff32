use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::AppError;

#[async_trait]
pub trait ImageCache {
    /// Whether `image` is tagged locally.
    async fn exists(&self, image: &str) -> Result<bool, AppError>;
    async fn pull(&self, image: &str) -> Result<(), AppError>;
    async fn tag(&self, source: &str, target: &str) -> Result<(), AppError>;
    async fn push(&self, image: &str) -> Result<(), AppError>;
    /// Remove the local tag `image`.
    async fn remove(&self, image: &str) -> Result<(), AppError>;
}

/// Shells out to a docker-compatible CLI.
pub struct CliImageCache {
    program: String,
}

impl CliImageCache {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, AppError> {
        let command = format!("{} {}", self.program, args.join(" "));
        debug!("Executing command: {}", command);

        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|source| AppError::CacheToolSpawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(AppError::CacheTool {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ImageCache for CliImageCache {
    async fn exists(&self, image: &str) -> Result<bool, AppError> {
        let ids = self.run(&["images", "-q", image]).await?;
        Ok(!ids.trim().is_empty())
    }

    async fn pull(&self, image: &str) -> Result<(), AppError> {
        self.run(&["pull", image]).await.map(drop)
    }

    async fn tag(&self, source: &str, target: &str) -> Result<(), AppError> {
        self.run(&["tag", source, target]).await.map(drop)
    }

    async fn push(&self, image: &str) -> Result<(), AppError> {
        self.run(&["push", image]).await.map(drop)
    }

    async fn remove(&self, image: &str) -> Result<(), AppError> {
        self.run(&["rmi", image]).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let cache = CliImageCache::new("regrm-no-such-tool");
        let err = cache.pull("registry/app:v1").await.unwrap_err();
        assert!(matches!(err, AppError::CacheToolSpawn { .. }));
        assert_eq!(err.exit_code(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_program_propagates_exit_code() {
        // `false` ignores its arguments and exits 1
        let cache = CliImageCache::new("false");
        let err = cache.push("registry/app:v1").await.unwrap_err();
        match err {
            AppError::CacheTool { ref command, code, .. } => {
                assert_eq!(command, "false push registry/app:v1");
                assert_eq!(code, Some(1));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exists_reads_stdout() {
        // `echo images -q x` prints a non-empty line
        let cache = CliImageCache::new("echo");
        assert!(cache.exists("registry/app:v1").await.unwrap());

        // `true` prints nothing
        let cache = CliImageCache::new("true");
        assert!(!cache.exists("registry/app:v1").await.unwrap());
    }
}
