//! Shared HTTP plumbing for provider adapters: auth, status mapping and the
//! single retry on rate limiting.

use std::fmt;
use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::errors::ProviderError;

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub verify_ssl: bool,
    /// Pause before the one retry after an HTTP 429.
    pub rate_limit_backoff: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            verify_ssl: true,
            rate_limit_backoff: Duration::from_millis(2000),
        }
    }
}

#[derive(Clone)]
pub enum Auth {
    /// GitLab `PRIVATE-TOKEN` header.
    PrivateToken(String),
    Basic { username: String, password: String },
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrivateToken(_) => f.write_str("PrivateToken(***)"),
            Self::Basic { username, .. } => write!(f, "Basic({username}:***)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    auth: Auth,
    rate_limit_backoff: Duration,
    kind: &'static str,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        auth: Auth,
        options: &HttpOptions,
        kind: &'static str,
    ) -> Result<Self, ProviderError> {
        reqwest::Url::parse(base_url).map_err(|_| ProviderError::InvalidUrl(base_url.to_string()))?;

        let client = reqwest::Client::builder()
            .user_agent("vcs-inventory")
            .danger_accept_invalid_certs(!options.verify_ssl)
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            rate_limit_backoff: options.rate_limit_backoff,
            kind,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, url: &str, query: &[(&str, String)]) -> RequestBuilder {
        let builder = self.client.get(url).query(query);
        match &self.auth {
            Auth::PrivateToken(token) => builder.header("PRIVATE-TOKEN", token),
            Auth::Basic { username, password } => builder.basic_auth(username, Some(password)),
        }
    }

    /// GET `path` (relative to the base url). Retries once on 429.
    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Response, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let mut retried = false;
        loop {
            let resp = self.request(&url, query).send().await?;
            let status = resp.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                crate::metrics::rate_limited(self.kind);
                if retried {
                    return Err(ProviderError::RateLimited { url });
                }
                tracing::warn!(
                    url = %url,
                    backoff_ms = self.rate_limit_backoff.as_millis() as u64,
                    "Rate limited, retrying once"
                );
                retried = true;
                tokio::time::sleep(self.rate_limit_backoff).await;
                continue;
            }

            return match status {
                s if s.is_success() => Ok(resp),
                StatusCode::NOT_FOUND => Err(ProviderError::NotFound { url }),
                StatusCode::FORBIDDEN => Err(ProviderError::Forbidden { url }),
                s => Err(ProviderError::Status {
                    status: s.as_u16(),
                    url,
                }),
            };
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        Ok(self.get(path, query).await?.json::<T>().await?)
    }

    /// Like `get_json`, but a 404 becomes `Ok(None)`.
    pub async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, ProviderError> {
        match self.get_json(path, query).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ApiClient {
        let options = HttpOptions {
            verify_ssl: true,
            rate_limit_backoff: Duration::from_millis(10),
        };
        ApiClient::new(
            &server.uri(),
            Auth::PrivateToken("secret".to_string()),
            &options,
            "gitlab",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn retries_once_after_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/user"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/user"))
            .and(header("PRIVATE-TOKEN", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 1})))
            .mount(&server)
            .await;

        let value: serde_json::Value = client(&server).get_json("/api/v4/user", &[]).await.unwrap();
        assert_eq!(value["id"], 1);
    }

    #[tokio::test]
    async fn second_rate_limit_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(2)
            .mount(&server)
            .await;

        let err = client(&server).get("/api/v4/projects", &[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn missing_resource_is_optional() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/42"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let found: Option<serde_json::Value> = client(&server)
            .get_optional("/api/v4/projects/42", &[])
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let err = ApiClient::new(
            "not a url",
            Auth::PrivateToken(String::new()),
            &HttpOptions::default(),
            "gitlab",
        )
        .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidUrl(_)));
    }

    #[test]
    fn auth_debug_hides_secrets() {
        let auth = Auth::Basic {
            username: "bot".to_string(),
            password: "hunter2".to_string(),
        };
        assert_eq!(format!("{auth:?}"), "Basic(bot:***)");
    }
}
