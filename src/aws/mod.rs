use std::time::Duration;

use aws_sdk_ec2::types::{IpPermission, IpRange};
use log::{debug, info};
use uuid::Uuid;

use crate::errors::MigratorError;
use crate::Result;

const POSTGRES_PORT: i32 = 5432;
const INGRESS_DESCRIPTION: &str = "Added by cloudsql migration team for GCP access";

/// Source-cloud adapter: the two RDS-side preparations a migration needs,
/// master credential reset and network reachability from the target VPC.
pub struct RdsApi {
    rds: aws_sdk_rds::Client,
    ec2: aws_sdk_ec2::Client,
}

impl RdsApi {
    pub async fn new() -> Self {
        let config = aws_config::load_from_env().await;
        Self {
            rds: aws_sdk_rds::Client::new(&config),
            ec2: aws_sdk_ec2::Client::new(&config),
        }
    }

    async fn instance_status(&self, instance: &str) -> Result<String> {
        let described = self
            .rds
            .describe_db_instances()
            .db_instance_identifier(instance)
            .send()
            .await
            .map_err(|e| MigratorError::AwsRdsError(Box::new(e.into())))?;
        described
            .db_instances()
            .and_then(|instances| instances.first())
            .and_then(|i| i.db_instance_status())
            .map(str::to_string)
            .ok_or_else(|| MigratorError::NotFound(format!("rds instance {instance}")))
    }

    /// Reset the instance's master password to a fresh random value and wait
    /// for the instance to settle back to `available`. Each invocation
    /// generates a new password; the caller persists it.
    pub async fn reset_master_password(&self, instance: &str) -> Result<String> {
        let new_password = Uuid::new_v4().to_string();
        self.rds
            .modify_db_instance()
            .db_instance_identifier(instance)
            .master_user_password(&new_password)
            .apply_immediately(true)
            .send()
            .await
            .map_err(|e| MigratorError::AwsRdsError(Box::new(e.into())))?;

        // the instance takes a moment to even enter its modifying state
        tokio::time::sleep(Duration::from_secs(12)).await;
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let status = self.instance_status(instance).await?;
            debug!("{instance} status = '{status}' => 'available'");
            if status == "available" {
                break;
            }
        }
        info!("reset master password for {instance}");
        Ok(new_password)
    }

    async fn security_group(&self, instance: &str) -> Result<aws_sdk_ec2::types::SecurityGroup> {
        let described = self
            .rds
            .describe_db_instances()
            .db_instance_identifier(instance)
            .send()
            .await
            .map_err(|e| MigratorError::AwsRdsError(Box::new(e.into())))?;
        let memberships = described
            .db_instances()
            .and_then(|instances| instances.first())
            .and_then(|i| i.vpc_security_groups())
            .unwrap_or_default();
        let group_id = match memberships {
            [] => {
                return Err(MigratorError::Invalid(format!(
                    "expected at least one security group for {instance} but none were found"
                )))
            }
            [only] => only.vpc_security_group_id().unwrap_or_default().to_string(),
            _ => {
                return Err(MigratorError::Invalid(format!(
                    "expected at most one security group for {instance} but many were found"
                )))
            }
        };

        let groups = self
            .ec2
            .describe_security_groups()
            .group_ids(&group_id)
            .send()
            .await
            .map_err(|e| MigratorError::AwsEc2Error(Box::new(e.into())))?;
        groups
            .security_groups()
            .and_then(|groups| groups.first())
            .cloned()
            .ok_or_else(|| MigratorError::NotFound(format!("security group {group_id}")))
    }

    /// Authorize inbound Postgres traffic for any of `cidr_blocks` not already
    /// covered by the instance's security group. Returns the newly added
    /// subset.
    pub async fn allow_ingress(&self, instance: &str, cidr_blocks: &[String]) -> Result<Vec<String>> {
        let group = self.security_group(instance).await?;
        let group_id = group.group_id().unwrap_or_default().to_string();
        let existing: Vec<&str> = group
            .ip_permissions()
            .unwrap_or_default()
            .iter()
            .filter(|p| {
                p.ip_protocol() == Some("tcp")
                    && p.from_port() == Some(POSTGRES_PORT)
                    && p.to_port() == Some(POSTGRES_PORT)
            })
            .flat_map(|p| p.ip_ranges().unwrap_or_default())
            .filter_map(|r| r.cidr_ip())
            .collect();

        let mut added = Vec::new();
        for cidr in cidr_blocks {
            if existing.contains(&cidr.as_str()) {
                continue;
            }
            self.ec2
                .authorize_security_group_ingress()
                .group_id(&group_id)
                .ip_permissions(
                    IpPermission::builder()
                        .ip_protocol("tcp")
                        .from_port(POSTGRES_PORT)
                        .to_port(POSTGRES_PORT)
                        .ip_ranges(
                            IpRange::builder()
                                .cidr_ip(cidr)
                                .description(INGRESS_DESCRIPTION)
                                .build(),
                        )
                        .build(),
                )
                .send()
                .await
                .map_err(|e| MigratorError::AwsEc2Error(Box::new(e.into())))?;
            added.push(cidr.clone());
        }
        Ok(added)
    }
}
