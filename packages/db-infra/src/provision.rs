//! Idempotent database and role provisioning.
//!
//! Creation is guarded by existence checks, not reconciliation: an
//! existing database or role is left exactly as found, including its
//! password and grants.

use std::collections::BTreeSet;

use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, DbErr, Statement};
use tracing::{debug, info};

use crate::conn::{quote_ident, quote_literal, validate_identifier};
use crate::error::DbInfraError;

/// Access-tier passwords, one per role kind.
#[derive(Debug, Clone)]
pub struct RolePasswords {
    pub admin: String,
    pub readonly: String,
    pub readwrite: String,
}

/// Role names derived from the database name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSet {
    pub admin: String,
    pub readonly: String,
    pub readwrite: String,
}

impl RoleSet {
    pub fn for_database(dbname: &str) -> Self {
        Self {
            admin: format!("{dbname}_admin"),
            readonly: format!("{dbname}_readonly"),
            readwrite: format!("{dbname}_readwrite"),
        }
    }
}

const SCHEMA: &str = "public";

async fn exec(conn: &DatabaseConnection, sql: String, what: &str) -> Result<(), DbInfraError> {
    conn.execute(Statement::from_string(DatabaseBackend::Postgres, sql))
        .await
        .map(|_| ())
        .map_err(|source| DbInfraError::Provisioning {
            what: what.to_string(),
            source,
        })
}

fn is_duplicate_object(err: &DbErr) -> bool {
    let text = err.to_string();
    text.contains("already exists") || text.contains("42P04") || text.contains("42710")
}

/// Ensure the named database exists, checking the server catalog live and
/// creating only when absent. `catalog` must be a connection to the
/// maintenance database, never to the target itself; database creation is
/// not valid inside a transaction block, so the statement runs autocommit.
///
/// Returns true when this call created the database.
pub async fn ensure_database(
    catalog: &DatabaseConnection,
    dbname: &str,
) -> Result<bool, DbInfraError> {
    validate_identifier(dbname)?;

    if database_exists(catalog, dbname).await? {
        debug!(db = %dbname, "database already exists");
        return Ok(false);
    }

    let create = Statement::from_string(
        DatabaseBackend::Postgres,
        format!("CREATE DATABASE {dbname}"),
    );
    match catalog.execute(create).await {
        Ok(_) => {
            info!(db = %dbname, "database created");
            Ok(true)
        }
        // A concurrent provisioner can win the race between our existence
        // check and the create; the backend's uniqueness failure then
        // means "already exists".
        Err(e) if is_duplicate_object(&e) => {
            debug!(db = %dbname, "lost creation race, database already exists");
            Ok(false)
        }
        Err(source) => Err(DbInfraError::Provisioning {
            what: format!("creating database {dbname}"),
            source,
        }),
    }
}

pub async fn database_exists(
    catalog: &DatabaseConnection,
    dbname: &str,
) -> Result<bool, DbInfraError> {
    let stmt = Statement::from_sql_and_values(
        DatabaseBackend::Postgres,
        "SELECT 1 AS present FROM pg_database WHERE datname = $1",
        [dbname.into()],
    );
    Ok(catalog.query_one(stmt).await?.is_some())
}

/// Single introspection of defined role names.
pub async fn role_names(conn: &DatabaseConnection) -> Result<BTreeSet<String>, DbInfraError> {
    let stmt = Statement::from_string(
        DatabaseBackend::Postgres,
        "SELECT rolname FROM pg_catalog.pg_roles".to_string(),
    );
    let rows = conn.query_all(stmt).await?;
    rows.iter()
        .map(|row| row.try_get("", "rolname").map_err(DbInfraError::from))
        .collect()
}

async fn current_user(conn: &DatabaseConnection) -> Result<String, DbInfraError> {
    let stmt = Statement::from_string(
        DatabaseBackend::Postgres,
        "SELECT current_user AS name".to_string(),
    );
    let row = conn
        .query_one(stmt)
        .await?
        .ok_or_else(|| DbInfraError::Db(DbErr::Custom("current_user returned no row".to_string())))?;
    Ok(row.try_get("", "name")?)
}

/// Ensure the admin/readonly/readwrite tiers exist for `dbname`, creating
/// only what is missing. `conn` must target the database itself (the
/// grants are schema-scoped).
///
/// Creating the admin role also grants it to the invoking session user
/// (managed Postgres refuses default-privilege statements for roles the
/// invoker is not a member of) and installs default privileges so tables
/// and sequences created by the admin in future migrations are reachable
/// by the other two tiers without re-granting.
pub async fn ensure_roles(
    conn: &DatabaseConnection,
    dbname: &str,
    passwords: &RolePasswords,
) -> Result<RoleSet, DbInfraError> {
    validate_identifier(dbname)?;
    let roles = RoleSet::for_database(dbname);
    for name in [&roles.admin, &roles.readonly, &roles.readwrite] {
        validate_identifier(name)?;
    }

    let existing = role_names(conn).await?;

    // Harmless to re-issue, so not behind an existence check.
    exec(
        conn,
        format!("REVOKE CREATE ON SCHEMA {SCHEMA} FROM PUBLIC"),
        "revoking public schema create",
    )
    .await?;
    exec(
        conn,
        format!("REVOKE ALL ON DATABASE {dbname} FROM PUBLIC"),
        "revoking public database access",
    )
    .await?;
    exec(
        conn,
        format!("CREATE SCHEMA IF NOT EXISTS {SCHEMA}"),
        "creating schema",
    )
    .await?;

    if !existing.contains(&roles.readonly) {
        let role = &roles.readonly;
        info!(role = %role, "creating readonly role");
        exec(
            conn,
            format!(
                "CREATE USER {role} WITH PASSWORD {}",
                quote_literal(&passwords.readonly)
            ),
            "creating readonly role",
        )
        .await?;
        for sql in [
            format!("GRANT CONNECT ON DATABASE {dbname} TO {role}"),
            format!("GRANT USAGE ON SCHEMA {SCHEMA} TO {role}"),
            format!("GRANT SELECT ON ALL TABLES IN SCHEMA {SCHEMA} TO {role}"),
        ] {
            exec(conn, sql, "granting readonly privileges").await?;
        }
    } else {
        debug!(role = %roles.readonly, "readonly role already exists");
    }

    if !existing.contains(&roles.readwrite) {
        let role = &roles.readwrite;
        info!(role = %role, "creating readwrite role");
        exec(
            conn,
            format!(
                "CREATE USER {role} WITH PASSWORD {}",
                quote_literal(&passwords.readwrite)
            ),
            "creating readwrite role",
        )
        .await?;
        for sql in [
            format!("GRANT CONNECT ON DATABASE {dbname} TO {role}"),
            format!("GRANT USAGE ON SCHEMA {SCHEMA} TO {role}"),
            format!("GRANT SELECT, INSERT, UPDATE, DELETE ON ALL TABLES IN SCHEMA {SCHEMA} TO {role}"),
            format!("GRANT USAGE ON ALL SEQUENCES IN SCHEMA {SCHEMA} TO {role}"),
        ] {
            exec(conn, sql, "granting readwrite privileges").await?;
        }
    } else {
        debug!(role = %roles.readwrite, "readwrite role already exists");
    }

    if !existing.contains(&roles.admin) {
        let role = &roles.admin;
        info!(role = %role, "creating admin role");
        exec(
            conn,
            format!(
                "CREATE USER {role} WITH PASSWORD {}",
                quote_literal(&passwords.admin)
            ),
            "creating admin role",
        )
        .await?;
        for sql in [
            format!("GRANT CONNECT ON DATABASE {dbname} TO {role}"),
            format!("GRANT USAGE, CREATE ON SCHEMA {SCHEMA} TO {role}"),
            format!("GRANT ALL ON DATABASE {dbname} TO {role}"),
        ] {
            exec(conn, sql, "granting admin privileges").await?;
        }

        let invoker = current_user(conn).await?;
        exec(
            conn,
            format!("GRANT {role} TO {}", quote_ident(&invoker)),
            "granting admin role to invoking user",
        )
        .await?;

        let ro = &roles.readonly;
        let rw = &roles.readwrite;
        for sql in [
            format!("ALTER DEFAULT PRIVILEGES FOR ROLE {role} GRANT USAGE ON SEQUENCES TO {rw}"),
            format!("ALTER DEFAULT PRIVILEGES FOR ROLE {role} GRANT SELECT, INSERT, UPDATE, DELETE ON TABLES TO {rw}"),
            format!("ALTER DEFAULT PRIVILEGES FOR ROLE {role} GRANT SELECT ON TABLES TO {ro}"),
            format!("ALTER DEFAULT PRIVILEGES FOR ROLE {role} GRANT SELECT ON SEQUENCES TO {ro}"),
        ] {
            exec(conn, sql, "setting default privileges").await?;
        }
    } else {
        debug!(role = %roles.admin, "admin role already exists");
    }

    Ok(roles)
}
