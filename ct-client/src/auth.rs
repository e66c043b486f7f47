use crate::{truncate_body, ClientOptions};
use ct_types::catalog::CatalogError;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Tokens are refreshed when less than this much lifetime is left.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

#[derive(Default)]
pub struct TokenCache {
    inner: RwLock<Option<CachedToken>>,
}

impl TokenCache {
    pub async fn get(&self, options: &ClientOptions) -> Result<String, CatalogError> {
        {
            let cached = self.inner.read().await;
            if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
                return Ok(token.value.clone());
            }
        }
        let mut cached = self.inner.write().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }
        let token = request_token(options).await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.inner.write().await = None;
    }
}

fn scope(options: &ClientOptions) -> String {
    options
        .credentials
        .scope
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| format!("manage_project:{}", options.project_key))
}

async fn request_token(options: &ClientOptions) -> Result<CachedToken, CatalogError> {
    let mut url = options.auth_url.clone();
    url.path_segments_mut()
        .map_err(|_| CatalogError::Unavailable(anyhow::anyhow!("Invalid auth url {}", options.auth_url)))?
        .pop_if_empty()
        .extend(["oauth", "token"]);
    let scope = scope(options);
    log::debug!("Requesting access token with scope {scope}");
    let response = options
        .http
        .post(url)
        .basic_auth(
            &options.credentials.client_id,
            Some(&options.credentials.client_secret),
        )
        .form(&[("grant_type", "client_credentials"), ("scope", scope.as_str())])
        .send()
        .await
        .map_err(|err| CatalogError::Unavailable(err.into()))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| CatalogError::Unavailable(err.into()))?;
    if !status.is_success() {
        return Err(CatalogError::Unavailable(anyhow::anyhow!(
            "Unable to obtain access token ({status}): {}",
            truncate_body(&text)
        )));
    }
    let token: TokenResponse = serde_json::from_str(&text)
        .map_err(|err| CatalogError::Decode(format!("token response: {err}")))?;
    Ok(CachedToken {
        value: token.access_token,
        expires_at: Instant::now() + Duration::from_secs(token.expires_in),
    })
}
