//! HTTP gateway transport.
//!
//! Objects live under `{base}/v1/{path}`: `POST` creates, `GET {id}`
//! describes, `PATCH {id}` modifies and `DELETE {id}` deletes. Every
//! request carries the region and, when configured, a bearer token.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

use super::ProviderResult;
use super::api::{ApiCall, CloudApi, RemoteObject};
use crate::config::ProviderKind;
use crate::error::ProviderError;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Wait assumed when a throttled response carries no `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Control-plane client speaking to a provider gateway over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCloudApi {
    client: Client,
    provider: ProviderKind,
    base_url: String,
    region: String,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct RequestBody<'a> {
    region: &'a str,
    params: &'a BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ObjectBody {
    id: String,
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
}

impl HttpCloudApi {
    /// Creates a client for the gateway at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        provider: ProviderKind,
        base_url: &str,
        region: &str,
        token: Option<String>,
    ) -> ProviderResult<Self> {
        Self::with_timeout(provider, base_url, region, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(
        provider: ProviderKind,
        base_url: &str,
        region: &str,
        token: Option<String>,
        timeout_secs: u64,
    ) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| {
                ProviderError::unavailable(provider, format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            region: region.to_string(),
            token,
        })
    }

    fn collection_url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path.trim_matches('/'))
    }

    fn object_url(&self, path: &str, id: &str) -> String {
        format!("{}/{id}", self.collection_url(path))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request
            .header(header::ACCEPT, "application/json")
            .query(&[("region", self.region.as_str())]);
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    /// Sends a request once and maps failures onto provider errors.
    async fn send(&self, request: RequestBuilder, target: &str) -> ProviderResult<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ProviderError::unavailable(self.provider, format!("Request failed: {e}")))?;

        let status = response.status();
        trace!("{} {target} -> {status}", self.provider);

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ProviderError::Throttled {
                provider: self.provider,
                retry_after_secs: retry_after,
            });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Unauthorized {
                provider: self.provider,
                message: if body.is_empty() {
                    String::from("Invalid API token")
                } else {
                    body
                },
            });
        }

        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound {
                provider: self.provider,
                remote_id: target.to_string(),
            });
        }

        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::unavailable(
                self.provider,
                format!("{status}: {body}"),
            ));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::api(self.provider, status.as_u16(), body));
        }

        Ok(response)
    }

    async fn read_object(&self, response: Response, path: &str) -> ProviderResult<RemoteObject> {
        let body: ObjectBody = response.json().await.map_err(|e| ProviderError::InvalidResponse {
            provider: self.provider,
            message: format!("Failed to parse response: {e}"),
        })?;

        Ok(RemoteObject {
            id: body.id,
            path: path.to_string(),
            attributes: body.attributes,
        })
    }
}

#[async_trait]
impl CloudApi for HttpCloudApi {
    fn provider(&self) -> ProviderKind {
        self.provider
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn create(&self, call: &ApiCall) -> ProviderResult<RemoteObject> {
        debug!("Creating {} object {}", self.provider, call.path);
        let body = RequestBody {
            region: &self.region,
            params: &call.params,
        };
        let request = self.client.post(self.collection_url(&call.path)).json(&body);
        let response = self.send(request, &call.path).await?;
        self.read_object(response, &call.path).await
    }

    async fn describe(&self, path: &str, id: &str) -> ProviderResult<Option<RemoteObject>> {
        let request = self.client.get(self.object_url(path, id));
        match self.send(request, id).await {
            Ok(response) => self.read_object(response, path).await.map(Some),
            Err(ProviderError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn modify(
        &self,
        path: &str,
        id: &str,
        params: &BTreeMap<String, Value>,
    ) -> ProviderResult<RemoteObject> {
        debug!("Modifying {} object {path}/{id}", self.provider);
        let body = RequestBody {
            region: &self.region,
            params,
        };
        let request = self.client.patch(self.object_url(path, id)).json(&body);
        let response = self.send(request, id).await?;
        self.read_object(response, path).await
    }

    async fn delete(&self, path: &str, id: &str) -> ProviderResult<()> {
        debug!("Deleting {} object {path}/{id}", self.provider);
        let request = self.client.delete(self.object_url(path, id));
        self.send(request, id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpCloudApi {
        HttpCloudApi::new(
            ProviderKind::Aws,
            &server.uri(),
            "eu-west-1",
            Some(String::from("t0k")),
        )
        .expect("client")
    }

    #[tokio::test]
    async fn test_create_posts_params() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/ec2/vpc"))
            .and(header("authorization", "Bearer t0k"))
            .and(query_param("region", "eu-west-1"))
            .and(body_partial_json(json!({"params": {"cidr_block": "10.0.0.0/16"}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "vpc-123",
                "attributes": {"cidr_block": "10.0.0.0/16"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let call = ApiCall::new("ec2/vpc").param("cidr_block", "10.0.0.0/16");
        let object = client(&server).create(&call).await.expect("create");
        assert_eq!(object.id, "vpc-123");
        assert_eq!(object.path, "ec2/vpc");
        assert_eq!(object.attributes["cidr_block"], json!("10.0.0.0/16"));
    }

    #[tokio::test]
    async fn test_throttled_honours_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = client(&server)
            .create(&ApiCall::new("ec2/vpc"))
            .await
            .expect_err("throttled");
        assert!(matches!(err, ProviderError::Throttled { retry_after_secs: 7, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/rds/db-instance/db-1"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad cidr"))
            .mount(&server)
            .await;

        let api = client(&server);

        let err = api.describe("rds/db-instance", "db-1").await.expect_err("503");
        assert!(matches!(err, ProviderError::Unavailable { .. }));
        assert!(err.is_transient());

        let err = api
            .modify("rds/db-instance", "db-1", &BTreeMap::new())
            .await
            .expect_err("403");
        assert!(matches!(err, ProviderError::Unauthorized { .. }));
        assert!(!err.is_transient());

        let err = api.create(&ApiCall::new("ec2/vpc")).await.expect_err("400");
        assert!(matches!(err, ProviderError::Api { status: 400, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_not_found_handling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let api = client(&server);
        let described = api.describe("ec2/vpc", "vpc-gone").await.expect("describe");
        assert!(described.is_none());

        let err = api.delete("ec2/vpc", "vpc-gone").await.expect_err("delete");
        assert!(matches!(err, ProviderError::NotFound { ref remote_id, .. } if remote_id == "vpc-gone"));
    }

    #[tokio::test]
    async fn test_unreadable_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client(&server)
            .create(&ApiCall::new("ec2/vpc"))
            .await
            .expect_err("invalid");
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_transient() {
        let api = HttpCloudApi::with_timeout(ProviderKind::Gcp, "http://127.0.0.1:9", "x", None, 2)
            .expect("client");
        let err = api.delete("run/services", "svc").await.expect_err("unreachable");
        assert!(matches!(err, ProviderError::Unavailable { .. }));
    }
}
