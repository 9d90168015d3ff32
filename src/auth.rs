use std::sync::LazyLock;

use regex::Regex;
use reqwest::Client;
use tracing::debug;

use crate::config::Credentials;
use crate::error::AppError;
use crate::models::{RawResponse, TokenResponse};

static CHALLENGE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z][A-Za-z0-9_-]*)\s*=\s*"([^"]*)""#).unwrap());

/// Parameters of a `Www-Authenticate: Bearer ...` challenge.
///
/// Fields stay empty when the header is missing or is not a Bearer challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub service: String,
    pub scope: String,
}

impl AuthChallenge {
    pub fn parse(header: Option<&str>) -> Self {
        let mut challenge = Self::default();
        let Some(header) = header else {
            return challenge;
        };

        let header = header.trim();
        let Some((scheme, params)) = header.split_once(char::is_whitespace) else {
            return challenge;
        };
        if !scheme.eq_ignore_ascii_case("bearer") {
            return challenge;
        }

        for caps in CHALLENGE_PARAM.captures_iter(params) {
            let value = caps[2].to_string();
            match caps[1].to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = value,
                "service" => challenge.service = value,
                "scope" => challenge.scope = value,
                _ => {}
            }
        }
        challenge
    }

    pub fn is_empty(&self) -> bool {
        self.realm.is_empty()
    }
}

/// GET realm?service=..&scope=.. and return the issued token.
///
/// The raw token-endpoint response is attached to the error on failure.
pub async fn fetch_token(
    client: &Client,
    challenge: &AuthChallenge,
    credentials: Option<&Credentials>,
) -> Result<String, AppError> {
    debug!(
        realm = %challenge.realm,
        service = %challenge.service,
        scope = %challenge.scope,
        "requesting bearer token"
    );

    let mut request = client.get(&challenge.realm).query(&[
        ("service", challenge.service.as_str()),
        ("scope", challenge.scope.as_str()),
    ]);
    if let Some(creds) = credentials {
        request = request.basic_auth(&creds.username, Some(&creds.password));
    }

    let resp = RawResponse::read(request.send().await?).await?;

    if !resp.status.is_success() {
        return Err(AppError::TokenRejected {
            realm: challenge.realm.clone(),
            status: resp.status.as_u16(),
            diagnostic: resp.render(true),
        });
    }

    // A body that is not JSON is treated like one without a token.
    let token = serde_json::from_str::<TokenResponse>(&resp.body)
        .unwrap_or_default()
        .into_token();

    match token {
        Some(token) => {
            debug!(length = token.len(), "bearer token obtained");
            Ok(token)
        }
        None => Err(AppError::TokenEmpty {
            realm: challenge.realm.clone(),
            diagnostic: resp.render(true),
        }),
    }
}
