use std::fmt;
use std::time::Duration;

use crate::cli::Cli;
use crate::error::AppError;

/// Username/password sent as HTTP Basic auth to the token realm.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a run needs, built once from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub insecure: bool,
    pub plain_http: bool,
    pub credentials: Option<Credentials>,
    pub tag_only: bool,
    pub cache_tool: String,
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            insecure: false,
            plain_http: false,
            credentials: None,
            tag_only: false,
            cache_tool: "docker".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Build the config; `prompt` is called when `--password` asks for one.
    pub fn from_cli<F>(cli: &Cli, prompt: F) -> Result<Self, AppError>
    where
        F: FnOnce() -> std::io::Result<String>,
    {
        let credentials = match (&cli.user, cli.password) {
            (None, true) => {
                return Err(AppError::usage("--password requires --user"));
            }
            (None, false) => None,
            (Some(username), true) => {
                let password = prompt()
                    .map_err(|e| AppError::usage(format!("Failed to read password: {}", e)))?;
                Some(Credentials {
                    username: username.clone(),
                    password,
                })
            }
            (Some(username), false) => Some(Credentials {
                username: username.clone(),
                password: cli.password_env.clone().unwrap_or_default(),
            }),
        };

        if cli.cache_tool.trim().is_empty() {
            return Err(AppError::usage("--cache-tool must not be empty"));
        }

        Ok(Self {
            insecure: cli.insecure,
            plain_http: cli.plain_http,
            credentials,
            tag_only: cli.tag_only,
            cache_tool: cli.cache_tool.clone(),
            timeout: Duration::from_secs(cli.timeout),
        })
    }

    pub fn scheme(&self) -> &'static str {
        if self.plain_http {
            "http"
        } else {
            "https"
        }
    }

    /// Base URL for a registry host, e.g. `https://registry:5000`.
    pub fn base_url(&self, host: &str) -> String {
        format!("{}://{}", self.scheme(), host)
    }
}
