use std::collections::BTreeMap;

use log::{debug, info};
use passwords::PasswordGenerator;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};

use super::GcpApi;
use crate::errors::MigratorError;
use crate::Result;

const SQLADMIN_ENDPOINT: &str = "https://sqladmin.googleapis.com/v1";
const RESOURCE_MANAGER_ENDPOINT: &str = "https://cloudresourcemanager.googleapis.com/v1";

#[derive(Debug, Clone, Deserialize)]
pub struct GcpProject {
    #[serde(rename = "projectId")]
    pub project_id: String,
    pub name: String,
}

impl GcpApi {
    /// All projects visible to the caller, keyed by display name.
    pub async fn list_projects(&self) -> Result<BTreeMap<String, GcpProject>> {
        let mut projects = BTreeMap::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!("{RESOURCE_MANAGER_ENDPOINT}/projects");
            if let Some(token) = &page_token {
                url = format!("{url}?pageToken={token}");
            }
            let body = self.call(Method::GET, &url, None).await?;
            if let Some(items) = body["projects"].as_array() {
                for item in items {
                    let project: GcpProject = serde_json::from_value(item.clone())?;
                    projects.insert(project.name.clone(), project);
                }
            }
            match body["nextPageToken"].as_str() {
                Some(token) if !token.is_empty() => page_token = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(projects)
    }

    /// Resolve a project's display name to its project id.
    pub async fn project_id(&self, name: &str) -> Result<String> {
        self.list_projects()
            .await?
            .get(name)
            .map(|p| p.project_id.clone())
            .ok_or_else(|| MigratorError::NotFound(format!("gcp project {name}")))
    }

    /// Address of a managed SQL instance, preferring the private interface.
    pub async fn get_host(&self, project: &str, instance: &str) -> Result<String> {
        let url = format!("{SQLADMIN_ENDPOINT}/projects/{project}/instances/{instance}");
        let body = self.call(Method::GET, &url, None).await?;
        let addresses = body["ipAddresses"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        addresses
            .iter()
            .find(|a| a["type"] == "PRIVATE")
            .or_else(|| addresses.first())
            .and_then(|a| a["ipAddress"].as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                MigratorError::NotFound(format!("address of sql instance {project}/{instance}"))
            })
    }

    /// Create a database user, generating a password when none is supplied.
    /// Idempotent per (instance, username): an existing user keeps a supplied
    /// password, and has a generated one applied so the caller can persist it.
    pub async fn create_user(
        &self,
        project: &str,
        instance: &str,
        username: &str,
        password: Option<String>,
    ) -> Result<String> {
        let users_url = format!("{SQLADMIN_ENDPOINT}/projects/{project}/instances/{instance}/users");
        let listing = self.call(Method::GET, &users_url, None).await?;
        let exists = listing["items"]
            .as_array()
            .map(|items| items.iter().any(|u| u["name"] == username))
            .unwrap_or(false);

        if exists {
            if let Some(password) = password {
                debug!("sql user {instance}/{username} exists, keeping stored password");
                return Ok(password);
            }
            let password = generate_user_password();
            let update_url = format!("{users_url}?name={username}&host=%25");
            self.call(
                Method::PUT,
                &update_url,
                Some(&json!({"name": username, "password": password})),
            )
            .await?;
            info!("reset password for existing sql user {instance}/{username}");
            return Ok(password);
        }

        let password = password.unwrap_or_else(generate_user_password);
        self.call(
            Method::POST,
            &users_url,
            Some(&json!({"name": username, "password": password})),
        )
        .await?;
        info!("created sql user {instance}/{username}");
        Ok(password)
    }

    pub async fn delete_instance(&self, project: &str, instance: &str) -> Result<()> {
        let url = format!("{SQLADMIN_ENDPOINT}/projects/{project}/instances/{instance}");
        self.call(Method::DELETE, &url, None).await?;
        Ok(())
    }
}

fn generate_user_password() -> String {
    let pg = PasswordGenerator {
        length: 16,
        numbers: true,
        lowercase_letters: true,
        uppercase_letters: true,
        symbols: false,
        spaces: false,
        exclude_similar_characters: false,
        strict: true,
    };
    pg.generate_one().unwrap()
}
