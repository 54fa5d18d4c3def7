use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use log::{debug, warn};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Row};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::errors::MigratorError;
use crate::Result;

/// Schemas that never take part in replication or grants.
const SYSTEM_SCHEMAS: &str =
    "'pg_catalog', 'information_schema', 'hdb_catalog', 'hdb_views', 'pglogical'";

#[derive(Debug, Clone)]
pub struct PgConn {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
}

impl PgConn {
    pub fn database(&self, dbname: &str) -> Self {
        Self {
            dbname: dbname.to_string(),
            ..self.clone()
        }
    }

    fn conninfo(&self) -> String {
        let quote = |v: &str| format!("'{}'", v.replace('\\', "\\\\").replace('\'', "\\'"));
        format!(
            "host={} port={} dbname={} user={} password={}",
            quote(&self.host),
            self.port,
            quote(&self.dbname),
            quote(&self.user),
            quote(&self.password)
        )
    }
}

/// SQL transport. The statements the migration runs are identical either way;
/// only how they reach the database differs, so the two implementations are
/// interchangeable at bootstrap.
#[async_trait]
pub trait SqlExec: Send + Sync {
    async fn execute(&self, conn: &PgConn, sql: &str) -> Result<()>;

    async fn query_rows(&self, conn: &PgConn, sql: &str) -> Result<Vec<Vec<String>>>;
}

/// Direct client transport, for running inside the cluster with network
/// reachability to the database.
pub struct DirectSql;

impl DirectSql {
    async fn connect(conn: &PgConn) -> Result<PgConnection> {
        let options = PgConnectOptions::new()
            .host(&conn.host)
            .port(conn.port)
            .database(&conn.dbname)
            .username(&conn.user)
            .password(&conn.password);
        Ok(PgConnection::connect_with(&options).await?)
    }
}

#[async_trait]
impl SqlExec for DirectSql {
    async fn execute(&self, conn: &PgConn, sql: &str) -> Result<()> {
        let mut connection = Self::connect(conn).await?;
        sqlx::query(sql).execute(&mut connection).await?;
        Ok(())
    }

    async fn query_rows(&self, conn: &PgConn, sql: &str) -> Result<Vec<Vec<String>>> {
        let mut connection = Self::connect(conn).await?;
        let rows = sqlx::query(sql).fetch_all(&mut connection).await?;
        Ok(rows
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.try_get::<String, _>(i).unwrap_or_default())
                    .collect()
            })
            .collect())
    }
}

/// Proxy-pod transport, for running the control plane locally: statements are
/// fed to `psql` exec'd in a pod that has network reachability.
pub struct PodExecSql {
    pods: Api<Pod>,
    pod_name: String,
}

impl PodExecSql {
    pub fn new(client: Client, namespace: &str, pod_name: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            pod_name: pod_name.to_string(),
        }
    }

    async fn psql(&self, conn: &PgConn, args: &[&str], sql: &str) -> Result<String> {
        let mut command = vec!["psql".to_string(), conn.conninfo()];
        command.extend(args.iter().map(|a| a.to_string()));
        command.extend(["-v".to_string(), "ON_ERROR_STOP=1".to_string()]);
        command.extend(["-c".to_string(), sql.to_string()]);

        let attach_params = AttachParams::default()
            .stdin(false)
            .stdout(true)
            .stderr(true)
            .tty(false);
        let mut attached = self
            .pods
            .exec(&self.pod_name, command, &attach_params)
            .await?;

        let mut stdout = String::new();
        if let Some(mut reader) = attached.stdout() {
            reader.read_to_string(&mut stdout).await.unwrap_or_default();
        }
        let mut stderr = String::new();
        if let Some(mut reader) = attached.stderr() {
            reader.read_to_string(&mut stderr).await.unwrap_or_default();
        }

        let status = match attached.take_status() {
            Some(status) => status.await.unwrap_or_default(),
            None => {
                return Err(MigratorError::KubeExecError(format!(
                    "no status from psql exec in pod {}",
                    self.pod_name
                )))
            }
        };
        match status.status.as_deref() {
            Some("Success") => Ok(stdout),
            _ => Err(MigratorError::KubeExecError(format!(
                "psql in pod {} failed: {}",
                self.pod_name,
                stderr.trim()
            ))),
        }
    }
}

#[async_trait]
impl SqlExec for PodExecSql {
    async fn execute(&self, conn: &PgConn, sql: &str) -> Result<()> {
        self.psql(conn, &[], sql).await.map(|_| ())
    }

    async fn query_rows(&self, conn: &PgConn, sql: &str) -> Result<Vec<Vec<String>>> {
        let output = self.psql(conn, &["-t", "-A", "-F", "|"], sql).await?;
        Ok(output
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| line.split('|').map(str::to_string).collect())
            .collect())
    }
}

pub async fn check_connection(sql: &dyn SqlExec, conn: &PgConn) -> Result<()> {
    sql.query_rows(conn, "SELECT 1").await?;
    debug!(
        "connection to '{}@{}:{}/{}' was successful",
        conn.user, conn.host, conn.port, conn.dbname
    );
    Ok(())
}

async fn list_schemas(sql: &dyn SqlExec, conn: &PgConn) -> Result<Vec<String>> {
    let rows = sql
        .query_rows(
            conn,
            &format!(
                "select distinct schemaname from pg_catalog.pg_tables \
                 where schemaname not in ({SYSTEM_SCHEMAS})"
            ),
        )
        .await?;
    Ok(rows.into_iter().filter_map(|r| r.into_iter().next()).collect())
}

/// readwrite gets full table privileges across every application schema;
/// anyone else gets SELECT on public only.
pub async fn grant_access(sql: &dyn SqlExec, conn: &PgConn, grantee: &str) -> Result<()> {
    let (privilege, schemas) = if grantee == "readwrite" {
        ("ALL PRIVILEGES", list_schemas(sql, conn).await?)
    } else {
        ("SELECT", vec!["public".to_string()])
    };
    for schema in schemas {
        sql.execute(
            conn,
            &format!("GRANT {privilege} ON ALL TABLES IN SCHEMA {schema} TO {grantee}"),
        )
        .await?;
    }
    Ok(())
}

pub async fn set_owner_all_tables(sql: &dyn SqlExec, conn: &PgConn, grantee: &str) -> Result<()> {
    let rows = sql
        .query_rows(
            conn,
            &format!(
                "select schemaname, tablename from pg_catalog.pg_tables \
                 where schemaname not in ({SYSTEM_SCHEMAS})"
            ),
        )
        .await?;
    for row in rows {
        if let [schema, table, ..] = row.as_slice() {
            sql.execute(conn, &format!("ALTER TABLE {schema}.{table} OWNER TO {grantee}"))
                .await?;
        }
    }
    Ok(())
}

async fn list_target_databases(sql: &dyn SqlExec, conn: &PgConn) -> Result<Vec<String>> {
    let rows = sql
        .query_rows(
            conn,
            "select rolname, datname from pg_database pgd \
             inner join pg_roles pgr on pgr.oid = pgd.datdba \
             where datistemplate = FALSE and datallowconn = TRUE and rolname <> 'rdsadmin'",
        )
        .await?;
    Ok(rows.into_iter().filter_map(|r| r.into_iter().nth(1)).collect())
}

async fn assign_replication_user(sql: &dyn SqlExec, conn: &PgConn, username: &str) -> Result<()> {
    sql.execute(conn, "CREATE EXTENSION IF NOT EXISTS pglogical")
        .await?;
    sql.execute(
        conn,
        &format!("GRANT SELECT ON ALL TABLES IN SCHEMA pglogical TO {username}"),
    )
    .await?;
    for schema in list_schemas(sql, conn).await? {
        debug!(
            "grant {} with usage & select on schema {}.{}",
            username, conn.dbname, schema
        );
        sql.execute(conn, &format!("GRANT USAGE ON SCHEMA {schema} TO {username}"))
            .await?;
        sql.execute(
            conn,
            &format!("GRANT SELECT ON ALL TABLES IN SCHEMA {schema} TO {username}"),
        )
        .await?;
        sql.execute(
            conn,
            &format!("GRANT SELECT ON ALL SEQUENCES IN SCHEMA {schema} TO {username}"),
        )
        .await?;
    }
    Ok(())
}

/// Create the logical-replication user the migration service connects as and
/// grant it what pglogical needs on every application database. Returns the
/// user's password, generated when none was supplied.
/// <https://cloud.google.com/database-migration/docs/postgres/configure-source-database>
pub async fn create_replication_user(
    sql: &dyn SqlExec,
    username: &str,
    password: Option<String>,
    conn: &PgConn,
) -> Result<String> {
    let password = password.unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Err(e) = sql.execute(conn, &format!("CREATE USER {username}")).await {
        debug!("create user {username}: {e} (assuming it exists)");
    }
    sql.execute(conn, &format!("ALTER USER {username} PASSWORD '{password}'"))
        .await?;
    sql.execute(conn, &format!("GRANT rds_replication TO {username}"))
        .await?;

    for db in list_target_databases(sql, conn).await? {
        let db_conn = conn.database(&db);
        if let Err(e) = assign_replication_user(sql, &db_conn, username).await {
            warn!("failed to assign replication user on db/{db}: {e}");
        }
    }
    Ok(password)
}
