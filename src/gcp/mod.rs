pub mod dms;
pub mod sqladmin;

use std::sync::Arc;

use google_cloud_auth::project::Config;
use google_cloud_auth::token::DefaultTokenSourceProvider;
use google_cloud_token::{TokenSource, TokenSourceProvider};
use log::debug;
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, Response, StatusCode};
use serde_json::Value;

use crate::errors::MigratorError;
use crate::Result;

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Authenticated client for the GCP REST surfaces this control plane needs:
/// Database Migration Service, Cloud SQL Admin and Resource Manager. Auth goes
/// through application-default credentials (workload identity in-cluster,
/// `gcloud auth application-default` locally).
pub struct GcpApi {
    http: reqwest::Client,
    token_source: Arc<dyn TokenSource>,
}

impl GcpApi {
    pub async fn new() -> Result<Self> {
        let scopes = [CLOUD_PLATFORM_SCOPE];
        let config = Config::default().with_scopes(&scopes);
        let provider = DefaultTokenSourceProvider::new(config)
            .await
            .map_err(|e| MigratorError::GcpAuthError(e.to_string()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            token_source: provider.token_source(),
        })
    }

    async fn request(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Response> {
        let token = self
            .token_source
            .token()
            .await
            .map_err(|e| MigratorError::GcpAuthError(e.to_string()))?;
        let mut req = self
            .http
            .request(method.clone(), url)
            .header(AUTHORIZATION, token);
        if let Some(body) = body {
            req = req.json(body);
        }
        let response = req.send().await?;
        debug!("{} {} -> {}", method, url, response.status());
        Ok(response)
    }

    /// Issue a request and fail with the response body on a non-2xx status.
    pub(crate) async fn call(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let response = self.request(method.clone(), url, body).await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(MigratorError::GcpApiError(format!(
                "{method} {url}: {status}: {detail}"
            )));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(response.json().await?)
    }

    /// GET that maps 404 to `None`.
    pub(crate) async fn get_opt(&self, url: &str) -> Result<Option<Value>> {
        let response = self.request(Method::GET, url, None).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(MigratorError::GcpApiError(format!(
                "GET {url}: {status}: {detail}"
            )));
        }
        Ok(Some(response.json().await?))
    }

    /// POST that treats an already-existing resource (409) as a reported,
    /// non-fatal outcome. Returns whether the resource was created.
    pub(crate) async fn create_opt(&self, url: &str, body: &Value) -> Result<bool> {
        let response = self.request(Method::POST, url, Some(body)).await?;
        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Ok(false);
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(MigratorError::GcpApiError(format!(
                "POST {url}: {status}: {detail}"
            )));
        }
        Ok(true)
    }
}

#[async_trait::async_trait]
impl crate::migration::CloudApi for GcpApi {
    async fn project_id(&self, name: &str) -> Result<String> {
        GcpApi::project_id(self, name).await
    }

    async fn upsert_connection_profile(
        &self,
        project: &str,
        region: &str,
        profile_id: &str,
        body: &Value,
    ) -> Result<()> {
        GcpApi::upsert_connection_profile(self, project, region, profile_id, body).await
    }

    async fn delete_connection_profile(&self, reference: &str) -> Result<()> {
        GcpApi::delete_connection_profile(self, reference).await
    }

    async fn create_migration_job(
        &self,
        project: &str,
        region: &str,
        job_id: &str,
        body: &Value,
    ) -> Result<()> {
        GcpApi::create_migration_job(self, project, region, job_id, body).await
    }

    async fn start_migration_job(&self, project: &str, region: &str, job_id: &str) -> Result<()> {
        GcpApi::start_migration_job(self, project, region, job_id).await
    }

    async fn get_dms_status(
        &self,
        project: &str,
        region: &str,
        job_id: &str,
    ) -> Result<Option<crate::types::DmsJobStatus>> {
        GcpApi::get_dms_status(self, project, region, job_id).await
    }

    async fn promote_dms_job(&self, project: &str, region: &str, job_id: &str) -> Result<()> {
        GcpApi::promote_dms_job(self, project, region, job_id).await
    }

    async fn delete_dms_job(&self, project: &str, region: &str, job_id: &str) -> Result<()> {
        GcpApi::delete_dms_job(self, project, region, job_id).await
    }

    async fn get_instance_name(
        &self,
        project: &str,
        region: &str,
        job_id: &str,
    ) -> Result<Option<String>> {
        GcpApi::get_instance_name(self, project, region, job_id).await
    }

    async fn get_host(&self, project: &str, instance: &str) -> Result<String> {
        GcpApi::get_host(self, project, instance).await
    }

    async fn create_user(
        &self,
        project: &str,
        instance: &str,
        username: &str,
        password: Option<String>,
    ) -> Result<String> {
        GcpApi::create_user(self, project, instance, username, password).await
    }

    async fn delete_instance(&self, project: &str, instance: &str) -> Result<()> {
        GcpApi::delete_instance(self, project, instance).await
    }
}
