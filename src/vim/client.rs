use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use reqwest::tls::Version;
use serde_json::{json, Value};
use super::{ApiError, ManagedObjectRef, ManagementApi, ServiceContent};

const SESSION_HEADER: &str = "vmware-api-session-id";
pub const DEFAULT_RELEASE: &str = "8.0.1.0";

/// Everything needed to open a session
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub release: String,
    pub insecure: bool,
}

/// JSON-over-HTTPS transport (`/sdk/vim25/{release}/{type}/{id}/{method|property}`)
pub struct HttpJsonClient {
    client: reqwest::Client,
    base_url: String,
    authority: String,
    session_id: String,
    content: ServiceContent,
    debug: AtomicBool,
}

impl HttpJsonClient {
    /// Fetch the service content and log in
    pub async fn connect(options: &ConnectOptions) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .min_tls_version(Version::TLS_1_2)
            .deflate(true)
            .brotli(true)
            .use_rustls_tls()
            .tls_built_in_root_certs(true)
            .danger_accept_invalid_certs(options.insecure)
            .build()?;

        let authority = format!("{}:{}", options.host, options.port);
        let base_url = format!("https://{}/sdk/vim25/{}", authority, options.release);
        log::debug!("Connecting to {}", base_url);

        let res = client.get(format!("{}/ServiceInstance/ServiceInstance/content", base_url))
            .header("Accept", "application/json")
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(Self::fault_from_response(res).await);
        }
        let content: ServiceContent = res.json().await?;

        let session_manager = content.session_manager.clone()
            .ok_or_else(|| ApiError::Decode("service content has no session manager".to_string()))?;
        let res = client.post(format!("{}/SessionManager/{}/Login", base_url, session_manager.value))
            .header("Accept", "application/json")
            .json(&json!({"userName": options.user, "password": options.password}))
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(Self::fault_from_response(res).await);
        }
        let session_id = res.headers().get(SESSION_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ApiError::NotAuthenticated("login response carried no session id".to_string()))?;

        if let Some(about) = &content.about {
            log::info!("Connected to {} (API {})", about.full_name, about.api_version);
        }

        Ok(Self {
            client,
            base_url,
            authority,
            session_id,
            content,
            debug: AtomicBool::new(false),
        })
    }

    fn object_url(&self, obj: &ManagedObjectRef, tail: &str) -> String {
        format!("{}/{}/{}/{}", self.base_url, obj.kind, obj.value, tail)
    }

    /// Transfer URLs come back with `*` as host; point them at the server we talk to
    pub fn rewrite_transfer_url(&self, url: &str) -> String {
        let Some((scheme, rest)) = url.split_once("://") else {
            return url.to_string();
        };
        let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
        if host == "*" || host.starts_with("*:") {
            format!("{}://{}/{}", scheme, self.authority, path)
        } else {
            url.to_string()
        }
    }

    async fn send(&self, method: Method, url: String, body: Option<&Value>) -> Result<Value, ApiError> {
        let debug = self.debug.load(Ordering::Relaxed);
        if debug {
            log::info!("-> {} {} {}", method, url, body.map(Value::to_string).unwrap_or_default());
        }

        let mut req = self.client.request(method, url.as_str())
            .header(SESSION_HEADER, &self.session_id)
            .header("Accept", "application/json");
        if let Some(body) = body {
            req = req.json(body);
        }
        let res = req.send().await?;

        match res.status() {
            StatusCode::NO_CONTENT => Ok(Value::Null),
            StatusCode::UNAUTHORIZED => Err(ApiError::NotAuthenticated(url)),
            status if status.is_success() => {
                let value: Value = res.json().await?;
                if debug {
                    log::info!("<- {}", value);
                }
                Ok(value)
            }
            _ => Err(Self::fault_from_response(res).await),
        }
    }

    async fn fault_from_response(res: reqwest::Response) -> ApiError {
        let status = res.status();
        match res.json::<Value>().await {
            Ok(body) => {
                let kind = super::type_name_of(&body).unwrap_or("Fault").to_string();
                let message = body.get("message").and_then(Value::as_str)
                    .or_else(|| super::value_at(&body, "faultMessage").and_then(|m| m.get(0)).and_then(|m| m.get("message")).and_then(Value::as_str))
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("HTTP {}", status));
                ApiError::Fault { kind, message }
            }
            Err(_) => ApiError::fault("HttpError", format!("HTTP {}: {}", status.as_u16(), status.canonical_reason().unwrap_or("Unknown error"))),
        }
    }
}

#[async_trait]
impl ManagementApi for HttpJsonClient {
    fn service_content(&self) -> &ServiceContent {
        &self.content
    }

    async fn invoke(&self, obj: &ManagedObjectRef, method: &str, params: Value) -> Result<Value, ApiError> {
        let body = if params.is_null() { json!({}) } else { params };
        self.send(Method::POST, self.object_url(obj, method), Some(&body)).await
    }

    async fn property(&self, obj: &ManagedObjectRef, name: &str) -> Result<Value, ApiError> {
        self.send(Method::GET, self.object_url(obj, name), None).await
    }

    async fn upload(&self, url: &str, data: Vec<u8>) -> Result<(), ApiError> {
        let url = self.rewrite_transfer_url(url);
        log::debug!("Uploading {} bytes to {}", data.len(), url);
        let res = self.client.put(url.as_str()).body(data).send().await?;
        if !res.status().is_success() {
            return Err(Self::fault_from_response(res).await);
        }
        Ok(())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        let url = self.rewrite_transfer_url(url);
        log::debug!("Downloading {}", url);
        let res = self.client.get(url.as_str()).send().await?;
        if !res.status().is_success() {
            return Err(Self::fault_from_response(res).await);
        }
        Ok(res.bytes().await?.to_vec())
    }

    fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
    }
}
