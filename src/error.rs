use thiserror::Error;

/// Process exit codes. The network ones follow curl's numbering.
pub mod exit_code {
    pub const USAGE: i32 = 1;
    pub const URL_MALFORMED: i32 = 3;
    pub const CONNECT: i32 = 7;
    pub const HTTP_STATUS: i32 = 22;
    pub const TIMEOUT: i32 = 28;
    pub const EMPTY_PAYLOAD: i32 = 42;
    pub const TRANSPORT: i32 = 56;
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Usage(String),

    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Registry sent no bearer challenge for {url}")]
    Challenge { url: String, diagnostic: String },

    #[error("Token request to {realm} returned status {status}")]
    TokenRejected {
        realm: String,
        status: u16,
        diagnostic: String,
    },

    #[error("Token endpoint {realm} returned no token")]
    TokenEmpty { realm: String, diagnostic: String },

    #[error("{method} {url} returned status {status}")]
    Request {
        method: String,
        url: String,
        status: u16,
        diagnostic: String,
    },

    #[error("Registry API error: {0}")]
    EmptyResponse(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("`{command}` failed with {}", describe_code(.code))]
    CacheTool {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to run `{command}`: {source}")]
    CacheToolSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not recreate {} tag(s): {}", .failed.len(), .failed.join(", "))]
    Recovery { failed: Vec<String>, code: i32 },
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

impl AppError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    /// Exit code the process should terminate with for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => exit_code::USAGE,
            Self::Transport(e) if e.is_timeout() => exit_code::TIMEOUT,
            Self::Transport(e) if e.is_connect() => exit_code::CONNECT,
            Self::Transport(e) if e.is_builder() => exit_code::URL_MALFORMED,
            Self::Transport(_) => exit_code::TRANSPORT,
            Self::Challenge { .. } => exit_code::URL_MALFORMED,
            Self::TokenRejected { .. } | Self::Request { .. } => exit_code::HTTP_STATUS,
            Self::TokenEmpty { .. } | Self::EmptyResponse(_) | Self::Json(_) => {
                exit_code::EMPTY_PAYLOAD
            }
            Self::CacheTool { code, .. } => code.unwrap_or(exit_code::USAGE),
            Self::CacheToolSpawn { .. } => exit_code::USAGE,
            Self::Recovery { code, .. } => *code,
        }
    }

    /// Raw output captured from the failing exchange, if any.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::Challenge { diagnostic, .. }
            | Self::TokenRejected { diagnostic, .. }
            | Self::TokenEmpty { diagnostic, .. }
            | Self::Request { diagnostic, .. } => Some(diagnostic.as_str()),
            Self::CacheTool { stderr, .. } if !stderr.is_empty() => Some(stderr.as_str()),
            _ => None,
        }
    }
}
