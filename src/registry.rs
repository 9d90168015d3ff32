use std::collections::{BTreeSet, HashSet};

use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, LINK, WWW_AUTHENTICATE};
use reqwest::{Client, Method};
use tracing::{debug, warn};

use crate::auth::{fetch_token, AuthChallenge};
use crate::config::{Config, Credentials};
use crate::error::AppError;
use crate::models::{CustomHeader, RawResponse, TagList};

pub const MANIFEST_V2_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

const DIGEST_HEADER: &str = "Docker-Content-Digest";

pub struct RegistryClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl RegistryClient {
    pub fn new(config: &Config, host: &str) -> Result<Self, AppError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .danger_accept_invalid_hostnames(config.insecure)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url(host).trim_end_matches('/').to_string(),
            credentials: config.credentials.clone(),
        })
    }

    /// Challenge, token, then the real request. No token is reused across calls.
    pub async fn perform_request(
        &self,
        url: &str,
        method: &Method,
        header: Option<&CustomHeader>,
    ) -> Result<RawResponse, AppError> {
        debug!("{} {} (probe)", method, url);
        let probe = self.send(url, method, header, None).await?;

        let challenge = AuthChallenge::parse(
            probe
                .headers
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok()),
        );

        if challenge.is_empty() {
            if probe.status.is_success() {
                debug!("{} {} needs no authentication", method, url);
                return Ok(probe);
            }
            return Err(AppError::Challenge {
                url: url.to_string(),
                diagnostic: probe.render(true),
            });
        }

        let token = fetch_token(&self.client, &challenge, self.credentials.as_ref()).await?;

        debug!("{} {}", method, url);
        let resp = self.send(url, method, header, Some(&token)).await?;
        if !resp.status.is_success() {
            return Err(AppError::Request {
                method: method.to_string(),
                url: url.to_string(),
                status: resp.status.as_u16(),
                diagnostic: resp.render(true),
            });
        }
        Ok(resp)
    }

    async fn send(
        &self,
        url: &str,
        method: &Method,
        header: Option<&CustomHeader>,
        token: Option<&str>,
    ) -> Result<RawResponse, AppError> {
        let mut request = self.client.request(method.clone(), url);
        if let Some(h) = header {
            request = request.header(h.name.clone(), h.value.clone());
        }
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let resp = request.send().await?;
        Ok(RawResponse::read(resp).await?)
    }

    /// GET /v2/<repo>/tags/list with pagination
    pub async fn list_tags(&self, repo: &str) -> Result<BTreeSet<String>, AppError> {
        let mut tags = BTreeSet::new();
        let mut url = format!("{}/v2/{}/tags/list", self.base_url, repo);
        let mut visited = HashSet::new();

        loop {
            if !visited.insert(url.clone()) {
                return Err(AppError::EmptyResponse(format!(
                    "Tag list pagination for {} loops back to {}",
                    repo, url
                )));
            }
            let resp = self.perform_request(&url, &Method::GET, None).await?;
            if resp.body.trim().is_empty() {
                return Err(AppError::EmptyResponse(format!(
                    "Empty tag list response for {}",
                    repo
                )));
            }

            let next_link = Self::parse_next_link(&resp.headers);

            let tag_list: TagList = serde_json::from_str(&resp.body)?;
            if let Some(t) = tag_list.tags {
                tags.extend(t);
            }

            match next_link {
                Some(next) => url = self.resolve_url(&next),
                None => break,
            }
        }

        Ok(tags)
    }

    /// GET /v2/<repo>/manifests/<tag>: read the Docker-Content-Digest header
    pub async fn manifest_digest(&self, repo: &str, tag: &str) -> Result<String, AppError> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repo, tag);
        let accept = CustomHeader::new(ACCEPT, MANIFEST_V2_MEDIA_TYPE);
        let resp = self
            .perform_request(&url, &Method::GET, Some(&accept))
            .await?;

        match resp.header(DIGEST_HEADER) {
            Some(digest) if !digest.trim().is_empty() => Ok(digest.trim().to_string()),
            _ => {
                warn!("{} {} answered without a digest", Method::GET, url);
                Err(AppError::EmptyResponse(format!(
                    "Missing {} header for {}:{}",
                    DIGEST_HEADER, repo, tag
                )))
            }
        }
    }

    /// DELETE /v2/<repo>/manifests/<digest>
    pub async fn delete_manifest(&self, repo: &str, digest: &str) -> Result<(), AppError> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repo, digest);
        self.perform_request(&url, &Method::DELETE, None).await?;
        Ok(())
    }

    /// Parse the Link header for pagination (next URL)
    fn parse_next_link(headers: &HeaderMap) -> Option<String> {
        let link = headers.get(LINK)?.to_str().ok()?;
        // Link: </v2/<repo>/tags/list?n=100&last=xxx>; rel="next"
        if link.contains("rel=\"next\"") {
            let start = link.find('<')? + 1;
            let rest = &link[start..];
            let end = rest.find('>')?;
            Some(rest[..end].to_string())
        } else {
            None
        }
    }

    /// Resolve a host-relative path against the base URL
    pub fn resolve_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }
}
