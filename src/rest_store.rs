use crate::models::{Device, EmailRequest, NotificationRecord, Project, User};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const ROBOTS: &str = "robots";
pub const PROJECTS: &str = "projects";
pub const USERS: &str = "users";
pub const NOTIFICATIONS: &str = "notifications";
pub const LOGS: &str = "logs";
pub const SEND_EMAIL: &str = "sendEmail";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: StatusCode },
    #[error("{resource}/{id} not found")]
    NotFound { resource: String, id: String },
    #[error("Failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Thin client for the fleet backend: a JSON key-value store with one
/// collection per resource.
#[derive(Debug, Clone)]
pub struct RestStore {
    client: Client,
    base_url: String,
}

impl RestStore {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(base_url, Client::new())
    }

    pub fn with_client(base_url: &str, client: Client) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, resource: &str, id: Option<&str>) -> String {
        match id {
            Some(id) => format!("{}/{}/{}", self.base_url, resource, id),
            None => format!("{}/{}", self.base_url, resource),
        }
    }

    async fn send_checked(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<reqwest::Response, StoreError> {
        let response = request.send().await.map_err(|source| StoreError::Http {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status {
                url: url.to_string(),
                status,
            });
        }
        Ok(response)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        url: String,
    ) -> Result<T, StoreError> {
        self.send_checked(request, &url)
            .await?
            .json::<T>()
            .await
            .map_err(|source| StoreError::Decode { url, source })
    }

    /// Writes only need a success status; some endpoints answer with an empty
    /// or non-JSON body.
    async fn send_write(&self, request: reqwest::RequestBuilder, url: String) -> Result<Value, StoreError> {
        let body = self
            .send_checked(request, &url)
            .await?
            .text()
            .await
            .map_err(|source| StoreError::Decode { url, source })?;
        Ok(serde_json::from_str(&body).unwrap_or(Value::Null))
    }

    pub async fn get_collection<T: DeserializeOwned>(&self, resource: &str) -> Result<Vec<T>, StoreError> {
        let url = self.url(resource, None);
        debug!("GET {}", url);
        self.send(self.client.get(&url), url).await
    }

    pub async fn get_one<T: DeserializeOwned>(&self, resource: &str, id: &str) -> Result<T, StoreError> {
        let url = self.url(resource, Some(id));
        debug!("GET {}", url);
        match self.send(self.client.get(&url), url).await {
            Err(StoreError::Status { status, .. }) if status == StatusCode::NOT_FOUND => Err(StoreError::NotFound {
                resource: resource.to_string(),
                id: id.to_string(),
            }),
            other => other,
        }
    }

    pub async fn post<B: Serialize + ?Sized>(&self, resource: &str, body: &B) -> Result<Value, StoreError> {
        let url = self.url(resource, None);
        debug!("POST {}", url);
        self.send_write(self.client.post(&url).json(body), url).await
    }

    pub async fn put<B: Serialize + ?Sized>(&self, resource: &str, id: &str, body: &B) -> Result<Value, StoreError> {
        let url = self.url(resource, Some(id));
        debug!("PUT {}", url);
        self.send_write(self.client.put(&url).json(body), url).await
    }

    pub async fn fetch_devices(&self) -> Result<Vec<Device>, StoreError> {
        let devices: Vec<Device> = self.get_collection(ROBOTS).await?;
        Ok(devices.into_iter().map(Device::normalized).collect())
    }

    pub async fn fetch_device(&self, id: &str) -> Result<Device, StoreError> {
        let device: Device = self.get_one(ROBOTS, id).await?;
        Ok(device.normalized())
    }

    pub async fn put_device(&self, device: &Device) -> Result<(), StoreError> {
        self.put(ROBOTS, &device.id, device).await.map(|_| ())
    }

    pub async fn fetch_project(&self, id: &str) -> Result<Project, StoreError> {
        self.get_one(PROJECTS, id).await
    }

    pub async fn fetch_users(&self) -> Result<Vec<User>, StoreError> {
        self.get_collection(USERS).await
    }

    pub async fn post_notification(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        self.post(NOTIFICATIONS, record).await.map(|_| ())
    }

    pub async fn post_log(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        self.post(LOGS, record).await.map(|_| ())
    }

    pub async fn send_email(&self, email: &EmailRequest) -> Result<(), StoreError> {
        self.post(SEND_EMAIL, email).await.map(|_| ())
    }
}
