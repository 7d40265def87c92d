//! Device-tunnel resolver: Cumulocity REST interactions that turn a device
//! external identity plus a named remote-access configuration into an
//! authenticated [`TunnelDescriptor`].

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::descriptor::TunnelDescriptor;
use crate::error::{AppError, AppResult};

const RETRY_MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAYS_MS: [u64; 2] = [250, 1000];

/// Caller-supplied credentials: either a bearer token directly, or the
/// inputs of the interactive login flow. The login flow itself (exchanging
/// user/password/TFA for a token) is an external collaborator's job; this
/// crate only ever sees the resulting token.
pub enum Credentials {
    Token(String),
}

/// Inputs to [`Resolver::resolve`].
pub struct ResolveInput {
    pub host: String,
    pub tenant_id: Option<String>,
    pub credentials: Credentials,
    pub external_id: String,
    pub external_type: String,
    pub configuration_name: String,
    pub verify_tls: bool,
}

impl ResolveInput {
    pub fn default_external_type() -> String {
        "c8y_Serial".to_string()
    }

    pub fn default_configuration_name() -> String {
        "Passthrough".to_string()
    }
}

#[derive(Debug, Deserialize)]
struct LoginOptionsResponse {
    #[serde(rename = "loginOptions")]
    login_options: Vec<LoginOption>,
}

#[derive(Debug, Deserialize)]
struct LoginOption {
    #[serde(rename = "type")]
    option_type: String,
    #[serde(rename = "initRequest", default)]
    init_request: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExternalIdResponse {
    #[serde(rename = "managedObject")]
    managed_object: ManagedObjectRef,
}

#[derive(Debug, Deserialize)]
struct ManagedObjectRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ConfigurationsResponse {
    #[serde(default)]
    configurations: Vec<RemoteAccessConfiguration>,
}

#[derive(Debug, Deserialize)]
struct RemoteAccessConfiguration {
    id: String,
    name: String,
}

/// Resolves a [`TunnelDescriptor`] from a base host, credentials, and a
/// device identity. One instance is built per Supervisor run and shares a
/// single `reqwest::Client`.
pub struct Resolver {
    http: Client,
}

impl Resolver {
    pub fn new() -> AppResult<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }

    /// Run the full resolve algorithm (ยง4.4): normalize host, discover
    /// tenant id, validate the token, resolve the device's managed-object
    /// id, resolve the named remote-access configuration, and construct the
    /// tunnel URL.
    pub async fn resolve(&self, input: ResolveInput) -> AppResult<TunnelDescriptor> {
        let base_host = normalize_host(&input.host);
        let Credentials::Token(token) = input.credentials;

        let tenant_id = match input.tenant_id {
            Some(t) => t,
            None => self.resolve_tenant_id(&base_host).await?,
        };

        self.validate_token(&base_host, &token).await?;

        let device_id = self
            .resolve_device_id(&base_host, &token, &input.external_type, &input.external_id)
            .await?;

        let configuration_id = self
            .resolve_configuration_id(&base_host, &token, &device_id, &input.configuration_name)
            .await?;

        Ok(TunnelDescriptor::new(
            base_host,
            tenant_id,
            device_id,
            configuration_id,
            token,
            input.verify_tls,
        ))
    }

    async fn resolve_tenant_id(&self, base_host: &str) -> AppResult<String> {
        let url = format!("{base_host}/tenant/loginOptions");
        let resp = self.get_with_retry(&url, None).await?;

        if !resp.status().is_success() {
            return Err(AppError::TenantNotFound(format!(
                "loginOptions returned HTTP {}",
                resp.status()
            )));
        }

        let body: LoginOptionsResponse = resp
            .json()
            .await
            .map_err(|e| AppError::TenantNotFound(format!("invalid loginOptions response: {e}")))?;

        // An OAUTH2_INTERNAL option may appear anywhere in the list; earlier
        // SSO entries must not shadow it.
        let internal = body
            .login_options
            .into_iter()
            .find(|o| o.option_type == "OAUTH2_INTERNAL")
            .ok_or_else(|| AppError::TenantNotFound("no OAUTH2_INTERNAL login option".into()))?;

        let init_request = internal
            .init_request
            .ok_or_else(|| AppError::TenantNotFound("OAUTH2_INTERNAL missing initRequest".into()))?;

        parse_tenant_id(&init_request)
            .ok_or_else(|| AppError::TenantNotFound(format!("unparseable initRequest: {init_request}")))
    }

    async fn validate_token(&self, base_host: &str, token: &str) -> AppResult<()> {
        let url = format!("{base_host}/tenant/currentTenant");
        let resp = self.get_with_retry(&url, Some(token)).await?;

        match resp.status() {
            StatusCode::OK => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(AppError::Auth("token rejected by currentTenant".into()))
            }
            s if s.is_server_error() => {
                Err(AppError::TunnelUnavailable(format!("currentTenant returned {s}")))
            }
            s => Err(AppError::Auth(format!("unexpected currentTenant status {s}"))),
        }
    }

    async fn resolve_device_id(
        &self,
        base_host: &str,
        token: &str,
        external_type: &str,
        external_id: &str,
    ) -> AppResult<String> {
        let url = format!("{base_host}/identity/externalIds/{external_type}/{external_id}");
        let resp = self.get_with_retry(&url, Some(token)).await?;

        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(AppError::DeviceNotFound(format!(
                    "{external_type}/{external_id}"
                )))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(AppError::Auth("token rejected by externalIds lookup".into()))
            }
            s => {
                return Err(AppError::TunnelUnavailable(format!(
                    "externalIds lookup returned {s}"
                )))
            }
        }

        let body: ExternalIdResponse = resp
            .json()
            .await
            .map_err(|e| AppError::DeviceNotFound(format!("invalid externalIds response: {e}")))?;
        Ok(body.managed_object.id)
    }

    async fn resolve_configuration_id(
        &self,
        base_host: &str,
        token: &str,
        device_id: &str,
        configuration_name: &str,
    ) -> AppResult<String> {
        let url = format!("{base_host}/service/remoteaccess/devices/{device_id}/configurations");
        let resp = self.get_with_retry(&url, Some(token)).await?;

        if !resp.status().is_success() {
            return Err(AppError::ConfigurationNotFound(format!(
                "configurations lookup returned {}",
                resp.status()
            )));
        }

        let body: ConfigurationsResponse = resp
            .json()
            .await
            .map_err(|e| AppError::ConfigurationNotFound(format!("invalid configurations response: {e}")))?;

        body.configurations
            .into_iter()
            .find(|c| c.name == configuration_name)
            .map(|c| c.id)
            .ok_or_else(|| AppError::ConfigurationNotFound(configuration_name.to_string()))
    }

    /// GET with the ยง4.4 retry policy: at most two retries, fixed backoff
    /// 250ms/1s, only on connection errors and 5xx. Auth failures and 404s
    /// return immediately so the caller can classify them.
    async fn get_with_retry(&self, url: &str, bearer: Option<&str>) -> AppResult<reqwest::Response> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let mut req = self.http.get(url);
            if let Some(token) = bearer {
                req = req.header("Authorization", format!("Bearer {token}"));
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() && attempt < RETRY_MAX_ATTEMPTS {
                        let delay = RETRY_DELAYS_MS[(attempt - 1) as usize];
                        warn!(url, %status, attempt, delay, "resolver request retrying");
                        sleep(Duration::from_millis(delay)).await;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    if attempt < RETRY_MAX_ATTEMPTS {
                        let delay = RETRY_DELAYS_MS[(attempt - 1) as usize];
                        warn!(url, error = %e, attempt, delay, "resolver request retrying after connection error");
                        sleep(Duration::from_millis(delay)).await;
                        continue;
                    }
                    debug!(url, error = %e, "resolver request failed, no more retries");
                    return Err(AppError::TunnelUnavailable(format!("request to {url} failed: {e}")));
                }
            }
        }
    }
}

/// Trim whitespace and trailing slashes; prepend `https://` if no scheme is
/// present.
fn normalize_host(host: &str) -> String {
    let trimmed = host.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Extract `tenant_id` from an `initRequest` string of the form
/// `tenant_id=t123&other=...`.
fn parse_tenant_id(init_request: &str) -> Option<String> {
    init_request.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == "tenant_id").then(|| v.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn host_normalization() {
        assert_eq!(normalize_host("  https://example.com/  "), "https://example.com");
        assert_eq!(normalize_host("https://example.com"), "https://example.com");
        assert_eq!(normalize_host("example.com"), "https://example.com");
    }

    #[test]
    fn tenant_id_parsed_regardless_of_position() {
        assert_eq!(
            parse_tenant_id("tenant_id=t123"),
            Some("t123".to_string())
        );
        assert_eq!(
            parse_tenant_id("other=x&tenant_id=t123"),
            Some("t123".to_string())
        );
    }

    #[tokio::test]
    async fn login_options_prefers_internal_regardless_of_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tenant/loginOptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "loginOptions": [
                    {"type": "OAUTH2"},
                    {"type": "OAUTH2_INTERNAL", "initRequest": "tenant_id=t123"},
                ]
            })))
            .mount(&server)
            .await;

        let resolver = Resolver::new().unwrap();
        let tenant = resolver.resolve_tenant_id(&server.uri()).await.unwrap();
        assert_eq!(tenant, "t123");
    }

    #[tokio::test]
    async fn tenant_not_found_when_no_internal_option() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tenant/loginOptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "loginOptions": [{"type": "OAUTH2"}]
            })))
            .mount(&server)
            .await;

        let resolver = Resolver::new().unwrap();
        let err = resolver.resolve_tenant_id(&server.uri()).await.unwrap_err();
        assert!(matches!(err, AppError::TenantNotFound(_)));
    }

    #[tokio::test]
    async fn device_not_found_maps_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/identity/externalIds/c8y_Serial/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let resolver = Resolver::new().unwrap();
        let err = resolver
            .resolve_device_id(&server.uri(), "tok", "c8y_Serial", "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn auth_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tenant/currentTenant"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = Resolver::new().unwrap();
        let err = resolver.validate_token(&server.uri(), "bad-token").await.unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
    }

    #[tokio::test]
    async fn server_error_is_retried_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tenant/currentTenant"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tenant/currentTenant"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let resolver = Resolver::new().unwrap();
        resolver.validate_token(&server.uri(), "tok").await.unwrap();
    }

    #[tokio::test]
    async fn configuration_matched_by_exact_case_sensitive_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/service/remoteaccess/devices/dev1/configurations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "configurations": [
                    {"id": "cfg-other", "name": "passthrough"},
                    {"id": "cfg-match", "name": "Passthrough"},
                ]
            })))
            .mount(&server)
            .await;

        let resolver = Resolver::new().unwrap();
        let id = resolver
            .resolve_configuration_id(&server.uri(), "tok", "dev1", "Passthrough")
            .await
            .unwrap();
        assert_eq!(id, "cfg-match");
    }
}
