//! HTTP implementation of the control-plane client

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use b0_core::{Organization, Policy, Socket, Tunnel};

use crate::{ApiError, Border0Api};

const DEFAULT_API_URL: &str = "https://api.border0.com/api/v1";

/// Bearer-token authenticated JSON client for the control plane.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    access_token: RwLock<String>,
}

#[derive(Serialize)]
struct SignKeyRequest {
    ssh_public_key: String,
}

#[derive(Deserialize)]
struct SignKeyResponse {
    #[serde(default)]
    signed_ssh_cert: String,
}

#[derive(Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    token: String,
}

impl ApiClient {
    /// Create a client for the default API endpoint, or the override in
    /// `BORDER0_API`.
    pub fn new(access_token: String) -> Result<Self, ApiError> {
        let base_url =
            std::env::var("BORDER0_API").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        Self::with_base_url(access_token, base_url)
    }

    /// Create a client against an explicit API endpoint.
    pub fn with_base_url(access_token: String, base_url: String) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: RwLock::new(access_token),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response, ApiError> {
        let token = self.access_token();
        let mut request = self
            .http
            .request(method, self.url(path))
            .bearer_auth(token)
            .header("x-client-requested-with", "b0-connector");

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }

        Ok(response)
    }

    async fn request_json<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ApiError> {
        let response = self.send(method, path, body).await?;
        Ok(response.json().await?)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request_json::<T, ()>(Method::GET, path, None).await
    }
}

#[async_trait]
impl Border0Api for ApiClient {
    async fn get_sockets(&self) -> Result<Vec<Socket>, ApiError> {
        self.get_json("socket").await
    }

    async fn get_socket(&self, socket_id: &str) -> Result<Socket, ApiError> {
        self.get_json(&format!("socket/{socket_id}")).await
    }

    async fn create_socket(&self, socket: &Socket) -> Result<Socket, ApiError> {
        self.request_json(Method::POST, "socket", Some(socket)).await
    }

    async fn update_socket(&self, socket_id: &str, socket: &Socket) -> Result<(), ApiError> {
        self.send(Method::PUT, &format!("socket/{socket_id}"), Some(socket))
            .await
            .map(|_| ())
    }

    async fn delete_socket(&self, socket_id: &str) -> Result<(), ApiError> {
        self.send::<()>(Method::DELETE, &format!("socket/{socket_id}"), None)
            .await
            .map(|_| ())
    }

    async fn get_organization(&self) -> Result<Organization, ApiError> {
        self.get_json("organization").await
    }

    async fn sign_ssh_key(&self, socket_id: &str, public_key: &str) -> Result<String, ApiError> {
        let body = SignKeyRequest {
            ssh_public_key: public_key.to_string(),
        };

        let response: SignKeyResponse = self
            .request_json(
                Method::POST,
                &format!("socket/{socket_id}/signkey"),
                Some(&body),
            )
            .await?;

        Ok(response.signed_ssh_cert)
    }

    async fn get_tunnel(&self, socket_id: &str, tunnel_id: &str) -> Result<Tunnel, ApiError> {
        self.get_json(&format!("socket/{socket_id}/tunnel/{tunnel_id}"))
            .await
    }

    async fn apply_policies(
        &self,
        socket: &Socket,
        policy_names: &[String],
    ) -> Result<(), ApiError> {
        if policy_names.is_empty() {
            return Ok(());
        }

        let policies: Vec<Policy> = self.get_json("policies").await?;

        for name in policy_names {
            let Some(policy) = policies.iter().find(|p| &p.name == name) else {
                warn!(policy = %name, socket = %socket.name, "policy not found, skipping");
                continue;
            };

            let body = json!({
                "actions": [{ "action": "add", "id": socket.socket_id }],
            });
            self.send(
                Method::PUT,
                &format!("policy/{}/socket", policy.id),
                Some(&body),
            )
            .await?;
            debug!(policy = %name, socket = %socket.name, "policy attached");
        }

        Ok(())
    }

    fn access_token(&self) -> String {
        self.access_token
            .read()
            .expect("token lock poisoned")
            .clone()
    }

    async fn refresh_token(&self) -> Result<(), ApiError> {
        let response: RefreshResponse = self
            .request_json::<RefreshResponse, ()>(Method::POST, "login/refresh", None)
            .await?;

        if !response.token.is_empty() {
            *self.access_token.write().expect("token lock poisoned") = response.token;
            debug!("access token refreshed");
        }

        Ok(())
    }
}
