//! Webhook authentication schemes.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::transport::{HttpMethod, HttpRequest, HttpTransport, RequestBody};
use crate::NodeError;

/// Where an API key is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyLocation {
    #[default]
    Header,
    Query,
}

fn default_api_key_name() -> String {
    "X-API-Key".to_string()
}

/// One of `{none, bearer, basic, api-key, oauth2}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        #[serde(default)]
        password: String,
    },
    ApiKey {
        key: String,
        #[serde(default = "default_api_key_name")]
        name: String,
        #[serde(default)]
        location: ApiKeyLocation,
    },
    #[serde(rename = "oauth2")]
    OAuth2 {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scope: Option<String>,
    },
}

impl AuthConfig {
    /// Map every credential string (e.g. to render templates).
    pub fn map_strings(&self, f: impl Fn(&str) -> String) -> Self {
        match self {
            Self::None => Self::None,
            Self::Bearer { token } => Self::Bearer { token: f(token) },
            Self::Basic { username, password } => Self::Basic {
                username: f(username),
                password: f(password),
            },
            Self::ApiKey {
                key,
                name,
                location,
            } => Self::ApiKey {
                key: f(key),
                name: name.clone(),
                location: *location,
            },
            Self::OAuth2 {
                token_url,
                client_id,
                client_secret,
                scope,
            } => Self::OAuth2 {
                token_url: f(token_url),
                client_id: f(client_id),
                client_secret: f(client_secret),
                scope: scope.as_deref().map(&f),
            },
        }
    }

    /// Attach credentials to `request`. OAuth2 fetches a client-credentials
    /// token through `transport` first.
    pub async fn apply(
        &self,
        mut request: HttpRequest,
        transport: &dyn HttpTransport,
    ) -> Result<HttpRequest, NodeError> {
        match self {
            Self::None => {}
            Self::Bearer { token } => {
                request = request.header("Authorization", format!("Bearer {token}"));
            }
            Self::Basic { username, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                request = request.header("Authorization", format!("Basic {encoded}"));
            }
            Self::ApiKey {
                key,
                name,
                location,
            } => match location {
                ApiKeyLocation::Header => request = request.header(name.clone(), key.clone()),
                ApiKeyLocation::Query => request.query.push((name.clone(), key.clone())),
            },
            Self::OAuth2 {
                token_url,
                client_id,
                client_secret,
                scope,
            } => {
                let token = fetch_client_credentials_token(
                    transport,
                    token_url,
                    client_id,
                    client_secret,
                    scope.as_deref(),
                )
                .await?;
                request = request.header("Authorization", format!("Bearer {token}"));
            }
        }
        Ok(request)
    }
}

async fn fetch_client_credentials_token(
    transport: &dyn HttpTransport,
    token_url: &str,
    client_id: &str,
    client_secret: &str,
    scope: Option<&str>,
) -> Result<String, NodeError> {
    let mut form = vec![
        ("grant_type".to_string(), "client_credentials".to_string()),
        ("client_id".to_string(), client_id.to_string()),
        ("client_secret".to_string(), client_secret.to_string()),
    ];
    if let Some(scope) = scope {
        form.push(("scope".to_string(), scope.to_string()));
    }

    let response = transport
        .send(HttpRequest::new(HttpMethod::POST, token_url).with_body(RequestBody::Form(form)))
        .await?;
    if !response.is_success() {
        return Err(NodeError::network(
            format!("oauth2 token endpoint returned HTTP {}", response.status),
            crate::transport::is_retryable_status(response.status),
        ));
    }

    response
        .body_value()
        .get("access_token")
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or_else(|| NodeError::network("oauth2 response has no access_token", false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use serde_json::json;

    #[tokio::test]
    async fn basic_auth_is_base64_encoded() {
        let transport = MockTransport::new();
        let auth = AuthConfig::Basic {
            username: "user".into(),
            password: "pass".into(),
        };
        let req = auth
            .apply(HttpRequest::new(HttpMethod::GET, "http://x"), &transport)
            .await
            .unwrap();
        assert_eq!(req.header_value("authorization"), Some("Basic dXNlcjpwYXNz"));
    }

    #[tokio::test]
    async fn api_key_can_go_in_the_query() {
        let transport = MockTransport::new();
        let auth: AuthConfig = serde_json::from_value(json!({
            "type": "api_key", "key": "k1", "name": "apikey", "location": "query"
        }))
        .unwrap();
        let req = auth
            .apply(HttpRequest::new(HttpMethod::GET, "http://x"), &transport)
            .await
            .unwrap();
        assert_eq!(req.query, vec![("apikey".to_string(), "k1".to_string())]);
    }

    #[tokio::test]
    async fn oauth2_fetches_token_before_the_call() {
        let transport = MockTransport::new().respond_json(200, json!({ "access_token": "tok" }));
        let auth: AuthConfig = serde_json::from_value(json!({
            "type": "oauth2", "token_url": "http://auth/token",
            "client_id": "id", "client_secret": "secret"
        }))
        .unwrap();
        let req = auth
            .apply(HttpRequest::new(HttpMethod::GET, "http://api"), &transport)
            .await
            .unwrap();
        assert_eq!(req.header_value("Authorization"), Some("Bearer tok"));
        assert_eq!(transport.requests()[0].url, "http://auth/token");
    }
}
