use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{StatusCode, Version};
use serde::Deserialize;

use crate::error::AppError;

/// GET /v2/<repo>/tags/list response
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct TagList {
    pub name: String,
    pub tags: Option<Vec<String>>,
}

/// Token endpoint response (Docker token auth)
#[derive(Debug, Default, Deserialize)]
pub struct TokenResponse {
    pub token: Option<String>,
    pub access_token: Option<String>,
}

impl TokenResponse {
    /// The bearer token, if the endpoint issued a non-empty one.
    pub fn into_token(self) -> Option<String> {
        self.token
            .filter(|t| !t.is_empty())
            .or(self.access_token.filter(|t| !t.is_empty()))
    }
}

fn reject_scheme(input: &str) -> Result<(), AppError> {
    let lower = input.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Err(AppError::usage(format!(
            "'{}' must not include a URL scheme (use --plain-http for HTTP registries)",
            input
        )));
    }
    Ok(())
}

/// `host[:port]/path/to/repo:tag`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub host: String,
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    /// Same repository, different tag.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            host: self.host.clone(),
            repository: self.repository.clone(),
            tag: tag.to_string(),
        }
    }
}

impl FromStr for ImageReference {
    type Err = AppError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        reject_scheme(input)?;

        let (host, rest) = input.split_once('/').ok_or_else(|| {
            AppError::usage(format!(
                "'{}' is not of the form host[:port]/repository:tag",
                input
            ))
        })?;
        if host.is_empty() {
            return Err(AppError::usage(format!("'{}' has an empty registry host", input)));
        }

        let (repository, tag) = rest
            .rsplit_once(':')
            .ok_or_else(|| AppError::usage(format!("'{}' has no tag", input)))?;
        if repository.is_empty() || repository.starts_with('/') || repository.ends_with('/') {
            return Err(AppError::usage(format!("'{}' has an invalid repository", input)));
        }
        if tag.is_empty() || tag.contains('/') {
            return Err(AppError::usage(format!("'{}' has an invalid tag", input)));
        }

        Ok(Self {
            host: host.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.host, self.repository, self.tag)
    }
}

/// Host-relative URL for raw mode, e.g. `registry:5000/v2/app/manifests/latest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTarget {
    pub host: String,
    pub path: String,
}

impl FromStr for RawTarget {
    type Err = AppError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        reject_scheme(input)?;
        let (host, path) = input.split_once('/').unwrap_or((input, ""));
        if host.is_empty() {
            return Err(AppError::usage(format!("'{}' has an empty registry host", input)));
        }
        Ok(Self {
            host: host.to_string(),
            path: format!("/{}", path),
        })
    }
}

/// Extra request header given as `Name: value`
#[derive(Debug, Clone)]
pub struct CustomHeader {
    pub name: HeaderName,
    pub value: HeaderValue,
}

impl CustomHeader {
    pub fn new(name: HeaderName, value: &'static str) -> Self {
        Self {
            name,
            value: HeaderValue::from_static(value),
        }
    }
}

impl FromStr for CustomHeader {
    type Err = AppError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = || AppError::usage(format!("'{}' is not a valid 'Name: value' header", input));
        let (name, value) = input.split_once(':').ok_or_else(invalid)?;
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| invalid())?;
        let value = HeaderValue::from_str(value.trim()).map_err(|_| invalid())?;
        Ok(Self { name, value })
    }
}

/// A fully read HTTP response.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub version: Version,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl RawResponse {
    pub async fn read(resp: reqwest::Response) -> Result<Self, reqwest::Error> {
        let version = resp.version();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await?;
        Ok(Self {
            version,
            status,
            headers,
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Body only, or status line + headers + blank line + body.
    pub fn render(&self, include_headers: bool) -> String {
        if !include_headers {
            return self.body.clone();
        }
        let mut out = format!("{:?} {}\n", self.version, self.status);
        for (name, value) in &self.headers {
            out.push_str(&format!(
                "{}: {}\n",
                name,
                String::from_utf8_lossy(value.as_bytes())
            ));
        }
        out.push('\n');
        out.push_str(&self.body);
        out
    }
}

/// Outcome of deleting one image
#[derive(Debug, Default)]
pub struct DeleteReport {
    pub image: String,
    pub digest: String,
    pub lost_tags: BTreeSet<String>,
    pub recreated: Vec<String>,
    pub failed: Vec<String>,
    /// Exit code of the first failed recreation.
    pub failure_code: Option<i32>,
}

impl DeleteReport {
    pub fn recovery_error(&self) -> Option<AppError> {
        if self.failed.is_empty() {
            return None;
        }
        Some(AppError::Recovery {
            failed: self.failed.clone(),
            code: self.failure_code.unwrap_or(crate::error::exit_code::USAGE),
        })
    }
}
