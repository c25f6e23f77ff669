//! In-memory OAuth token exchange for `Auth::OAuth` endpoints, spec §4.5's
//! "refresh-before-expiry" requirement. Grounded on the teacher's
//! `RefreshingAuthClient` (`client.rs`) for the cache-then-refresh shape, but
//! the grant itself is `client_credentials`/`refresh_token` against
//! `token_url` rather than the teacher's interactive browser
//! authorization-code flow — NCP runs headless, so there is no user agent to
//! hand a `device_url` consent screen to. Device-code/authorization-code
//! login remains an Open Question for an interactive front end built on top
//! of this crate (see DESIGN.md).

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::NcpError;
use crate::model::Auth;

/// Refresh this long before the token's reported expiry so a request that
/// starts just before expiry doesn't race the clock.
const EXPIRY_SKEW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<SystemTime>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        match self.expires_at {
            Some(exp) => exp > SystemTime::now() + EXPIRY_SKEW,
            None => true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Per-endpoint cache of access tokens, keyed by endpoint name. Owned by the
/// `RmcpConnector` rather than the `Endpoint` value itself, since endpoints
/// are cloned freely and a token cache must not be.
#[derive(Default)]
pub struct OAuthTokenCache {
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl OAuthTokenCache {
    /// Resolve a bearer token for `endpoint_name`, refreshing or fetching a
    /// fresh one via `auth`'s grant if the cached token is stale or absent.
    /// Returns `Ok(None)` for any `Auth` variant other than `OAuth` — callers
    /// should fall back to `transport::connect`'s own handling of
    /// `Bearer`/`Basic` in that case.
    pub async fn bearer_token(&self, endpoint_name: &str, auth: &Auth) -> Result<Option<String>, NcpError> {
        let Auth::OAuth {
            client_id,
            client_secret,
            token_url,
            scopes,
            ..
        } = auth
        else {
            return Ok(None);
        };

        {
            let cache = self.tokens.lock().await;
            if let Some(cached) = cache.get(endpoint_name) {
                if cached.is_fresh() {
                    return Ok(Some(cached.access_token.clone()));
                }
            }
        }

        let refresh_token = {
            let cache = self.tokens.lock().await;
            cache.get(endpoint_name).and_then(|c| c.refresh_token.clone())
        };

        let response = if let Some(refresh_token) = refresh_token {
            request_token(
                token_url,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token.as_str()),
                    ("client_id", client_id.as_str()),
                ],
                client_secret.as_deref(),
            )
            .await
        } else {
            let scope = scopes.join(" ");
            request_token(
                token_url,
                &[
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("scope", scope.as_str()),
                ],
                client_secret.as_deref(),
            )
            .await
        }?;

        let expires_at = response.expires_in.map(|secs| SystemTime::now() + Duration::from_secs(secs));
        let token = CachedToken {
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token,
            expires_at,
        };
        self.tokens.lock().await.insert(endpoint_name.to_string(), token);
        Ok(Some(response.access_token))
    }
}

async fn request_token(
    token_url: &str,
    params: &[(&str, &str)],
    client_secret: Option<&str>,
) -> Result<TokenResponse, NcpError> {
    let client = reqwest::Client::new();
    let mut req = client.post(token_url).form(params);
    if let Some(secret) = client_secret {
        req = req.basic_auth(params.iter().find(|(k, _)| *k == "client_id").map(|(_, v)| *v).unwrap_or(""), Some(secret));
    }
    let resp = req
        .send()
        .await
        .map_err(|e| NcpError::AuthFailed(format!("oauth token request failed: {e}")))?;

    if !resp.status().is_success() {
        return Err(NcpError::AuthFailed(format!(
            "oauth token endpoint returned {}",
            resp.status()
        )));
    }
    resp.json::<TokenResponse>()
        .await
        .map_err(|e| NcpError::AuthFailed(format!("oauth token response malformed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oauth_auth(token_url: &str) -> Auth {
        Auth::OAuth {
            client_id: "client".into(),
            client_secret: Some("secret".into()),
            device_url: String::new(),
            token_url: token_url.into(),
            scopes: vec!["mcp".into()],
            refresh_state: None,
        }
    }

    #[tokio::test]
    async fn non_oauth_auth_yields_no_token() {
        let cache = OAuthTokenCache::default();
        let result = cache.bearer_token("ep", &Auth::None).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn unreachable_token_endpoint_yields_auth_failed() {
        let cache = OAuthTokenCache::default();
        let auth = oauth_auth("http://127.0.0.1:1/token");
        let err = cache.bearer_token("ep", &auth).await.unwrap_err();
        assert!(matches!(err, NcpError::AuthFailed(_)));
    }

    #[test]
    fn cached_token_without_expiry_is_always_fresh() {
        let token = CachedToken {
            access_token: "abc".into(),
            refresh_token: None,
            expires_at: None,
        };
        assert!(token.is_fresh());
    }

    #[test]
    fn cached_token_past_skew_window_is_stale() {
        let token = CachedToken {
            access_token: "abc".into(),
            refresh_token: None,
            expires_at: Some(SystemTime::now() + Duration::from_secs(5)),
        };
        assert!(!token.is_fresh());
    }
}
