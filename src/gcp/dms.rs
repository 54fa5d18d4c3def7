use log::{debug, info};
use reqwest::Method;
use serde_json::Value;

use super::GcpApi;
use crate::types::DmsJobStatus;
use crate::Result;

const DMS_ENDPOINT: &str = "https://datamigration.googleapis.com/v1";

fn location(project: &str, region: &str) -> String {
    format!("{DMS_ENDPOINT}/projects/{project}/locations/{region}")
}

impl GcpApi {
    /// Create the connection profile, or patch it when it already exists.
    pub async fn upsert_connection_profile(
        &self,
        project: &str,
        region: &str,
        profile_id: &str,
        body: &Value,
    ) -> Result<()> {
        let create_url = format!(
            "{}/connectionProfiles?connectionProfileId={}",
            location(project, region),
            profile_id
        );
        if self.create_opt(&create_url, body).await? {
            info!("created connection profile {profile_id}");
            return Ok(());
        }
        debug!("connection profile {profile_id} exists, updating");
        let patch_url = format!("{}/connectionProfiles/{}", location(project, region), profile_id);
        self.call(Method::PATCH, &patch_url, Some(body)).await?;
        Ok(())
    }

    pub async fn delete_connection_profile(&self, reference: &str) -> Result<()> {
        let url = format!("{DMS_ENDPOINT}/{reference}");
        self.call(Method::DELETE, &url, None).await?;
        Ok(())
    }

    /// Create a migration job; a job that already exists is left untouched.
    pub async fn create_migration_job(
        &self,
        project: &str,
        region: &str,
        job_id: &str,
        body: &Value,
    ) -> Result<()> {
        let url = format!(
            "{}/migrationJobs?migrationJobId={}",
            location(project, region),
            job_id
        );
        if self.create_opt(&url, body).await? {
            info!("created migration job {job_id}");
        } else {
            debug!("migration job {job_id} exists");
        }
        Ok(())
    }

    pub async fn start_migration_job(&self, project: &str, region: &str, job_id: &str) -> Result<()> {
        let url = format!("{}/migrationJobs/{}:start", location(project, region), job_id);
        self.call(Method::POST, &url, Some(&Value::Object(Default::default())))
            .await?;
        Ok(())
    }

    /// Current state and phase of a migration job, `None` if the job does not
    /// exist.
    pub async fn get_dms_status(
        &self,
        project: &str,
        region: &str,
        job_id: &str,
    ) -> Result<Option<DmsJobStatus>> {
        let url = format!("{}/migrationJobs/{}", location(project, region), job_id);
        Ok(self.get_opt(&url).await?.map(DmsJobStatus::from_body))
    }

    /// Promote the destination instance to a standalone primary.
    pub async fn promote_dms_job(&self, project: &str, region: &str, job_id: &str) -> Result<()> {
        let url = format!("{}/migrationJobs/{}:promote", location(project, region), job_id);
        self.call(Method::POST, &url, Some(&Value::Object(Default::default())))
            .await?;
        Ok(())
    }

    pub async fn delete_dms_job(&self, project: &str, region: &str, job_id: &str) -> Result<()> {
        let url = format!("{}/migrationJobs/{}", location(project, region), job_id);
        self.call(Method::DELETE, &url, None).await?;
        Ok(())
    }

    /// Name of the managed SQL instance a migration job replicates into,
    /// derived from the job's destination connection-profile reference.
    pub async fn get_instance_name(
        &self,
        project: &str,
        region: &str,
        job_id: &str,
    ) -> Result<Option<String>> {
        let status = self.get_dms_status(project, region, job_id).await?;
        Ok(status.and_then(|s| {
            s.body["destination"]
                .as_str()
                .and_then(|d| d.rsplit('/').next())
                .map(str::to_string)
        }))
    }
}
