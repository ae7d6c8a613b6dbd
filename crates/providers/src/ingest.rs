//! Client for the downstream document-ingestion API.
//!
//! The pipeline only ever writes to this service: it logs in, creates a
//! project, and pushes plain-text files into it.

use crate::ProviderError;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct IngestConfig {
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub filename: String,
    pub content: String,
}

#[async_trait::async_trait]
pub trait IngestionApi: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<String, ProviderError>;

    async fn create_project(
        &self,
        name: &str,
        description: &str,
        token: Option<&str>,
    ) -> Result<String, ProviderError>;

    /// Uploads one batch of files. A non-2xx reply is an error for the whole batch.
    async fn upload(
        &self,
        project_id: &str,
        files: &[UploadFile],
        token: Option<&str>,
    ) -> Result<(), ProviderError>;
}

#[derive(Clone)]
pub struct HttpIngestClient {
    client: Client,
    cfg: IngestConfig,
}

impl HttpIngestClient {
    pub fn new(cfg: IngestConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        Ok(Self { client, cfg })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    #[serde(default)]
    user: Option<LoginUser>,
}

#[derive(Debug, Deserialize)]
struct LoginUser {
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateProjectResponse {
    project_id: String,
}

async fn status_error(resp: reqwest::Response) -> ProviderError {
    let status = resp.status().as_u16();
    let body = resp.bytes().await.unwrap_or(Bytes::from_static(b""));
    ProviderError::Status {
        status,
        body: String::from_utf8_lossy(&body).into_owned(),
    }
}

#[async_trait::async_trait]
impl IngestionApi for HttpIngestClient {
    async fn login(&self, email: &str, password: &str) -> Result<String, ProviderError> {
        #[derive(Serialize)]
        struct LoginRequest<'a> {
            email: &'a str,
            password: &'a str,
        }
        let resp = self
            .client
            .post(self.url("/auth/login"))
            .json(&LoginRequest { email, password })
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        if resp.status() != StatusCode::OK {
            return Err(status_error(resp).await);
        }
        let parsed: LoginResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        let who = parsed
            .user
            .and_then(|u| u.email)
            .unwrap_or_else(|| email.to_string());
        info!("Logged in as: {}", who);
        Ok(parsed.token)
    }

    async fn create_project(
        &self,
        name: &str,
        description: &str,
        token: Option<&str>,
    ) -> Result<String, ProviderError> {
        #[derive(Serialize)]
        struct CreateProject<'a> {
            name: &'a str,
            description: &'a str,
        }
        let mut builder = self
            .client
            .post(self.url("/projects"))
            .json(&CreateProject { name, description });
        if let Some(t) = token {
            builder = builder.bearer_auth(t);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        if resp.status() != StatusCode::CREATED {
            return Err(status_error(resp).await);
        }
        let parsed: CreateProjectResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        info!("Created project: {} \"{}\"", parsed.project_id, name);
        Ok(parsed.project_id)
    }

    async fn upload(
        &self,
        project_id: &str,
        files: &[UploadFile],
        token: Option<&str>,
    ) -> Result<(), ProviderError> {
        let mut form = reqwest::multipart::Form::new();
        for file in files {
            let part = reqwest::multipart::Part::bytes(file.content.clone().into_bytes())
                .file_name(file.filename.clone())
                .mime_str("text/plain")
                .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
            form = form.part("files", part);
        }
        let mut builder = self
            .client
            .post(self.url(&format!("/projects/{project_id}/documents/upload")))
            .multipart(form);
        if let Some(t) = token {
            builder = builder.bearer_auth(t);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        match resp.status() {
            StatusCode::OK | StatusCode::ACCEPTED => Ok(()),
            _ => Err(status_error(resp).await),
        }
    }
}
