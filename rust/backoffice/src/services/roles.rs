//! Roles and their permission sets.

use crate::error::{Result, ServiceError};
use crate::services::{decode, decode_rows, encode, maybe_decode};
use chrono::{DateTime, Utc};
use connstore::Db;
use restdb::{maybe_single, Filter, Querier, SelectQuery};
use serde::{Deserialize, Serialize};
use serde_json::json;

const TABLE: &str = "roles";

/// Role code granting unrestricted access. Guarded specially in the user
/// service: the last active holder cannot be removed.
pub const SUPER_ADMIN_ROLE: &str = "super_admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleScope {
    Global,
    Network,
    Point,
    Assigned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: String,
    pub code: String,
    pub name: String,
    pub scope: RoleScope,
    pub permissions: Vec<String>,
    pub is_system: bool,
    /// Optimistic-concurrency version, incremented on every update.
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RoleRow {
    #[serde(default)]
    id: String,
    code: String,
    name: String,
    scope: RoleScope,
    permissions: Vec<String>,
    is_system: bool,
    version: i64,
    created_at: DateTime<Utc>,
}

fn to_domain(row: RoleRow) -> Role {
    Role {
        id: row.id,
        code: row.code,
        name: row.name,
        scope: row.scope,
        permissions: row.permissions,
        is_system: row.is_system,
        version: row.version,
        created_at: row.created_at,
    }
}

#[derive(Debug, Clone)]
pub struct NewRole {
    pub code: String,
    pub name: String,
    pub scope: RoleScope,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RoleUpdate {
    pub name: Option<String>,
    pub scope: Option<RoleScope>,
    pub permissions: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct RoleService {
    db: Db,
}

impl RoleService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn list(&self) -> Result<Vec<Role>> {
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().order("code"))
            .await?;
        Ok(decode_rows::<RoleRow>(TABLE, rows)?
            .into_iter()
            .map(to_domain)
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Role>> {
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().eq("id", id).limit(1))
            .await?;
        maybe_decode::<RoleRow>(TABLE, rows).map(|row| row.map(to_domain))
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Option<Role>> {
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().eq("code", code).limit(1))
            .await?;
        maybe_decode::<RoleRow>(TABLE, rows).map(|row| row.map(to_domain))
    }

    pub async fn roles_by_codes(&self, codes: &[String]) -> Result<Vec<Role>> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        let values = codes.iter().map(|c| json!(c)).collect();
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().in_("code", values))
            .await?;
        Ok(decode_rows::<RoleRow>(TABLE, rows)?
            .into_iter()
            .map(to_domain)
            .collect())
    }

    pub async fn create(&self, input: NewRole) -> Result<Role> {
        if input.code.trim().is_empty() {
            return Err(ServiceError::Validation("role code is required".into()));
        }
        let taken = {
            let rows = self
                .db
                .select(
                    TABLE,
                    &SelectQuery::new().columns("id").eq("code", input.code.as_str()),
                )
                .await?;
            maybe_single(rows).is_some()
        };
        if taken {
            return Err(ServiceError::Validation(format!(
                "role code '{}' already exists",
                input.code
            )));
        }

        let row = json!({
            "code": input.code,
            "name": input.name,
            "scope": encode(&input.scope)?,
            "permissions": input.permissions,
            "is_system": false,
            "version": 1,
            "created_at": Utc::now(),
        });
        let inserted = self.db.insert(TABLE, vec![row]).await?;
        let row: RoleRow = decode(TABLE, restdb::single(TABLE, inserted)?)?;
        Ok(to_domain(row))
    }

    /// Update a role with an optimistic version check. The filter on the
    /// expected version makes the check a storage-layer compare-and-swap: a
    /// zero-row update means somebody got there first.
    pub async fn update(&self, id: &str, expected_version: i64, update: RoleUpdate) -> Result<Role> {
        let existing = self
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::Validation(format!("role '{id}' not found")))?;
        if existing.is_system {
            return Err(ServiceError::Validation("Cannot edit system role".into()));
        }

        let mut patch = serde_json::Map::new();
        if let Some(name) = update.name {
            patch.insert("name".into(), json!(name));
        }
        if let Some(scope) = update.scope {
            patch.insert("scope".into(), encode(&scope)?);
        }
        if let Some(permissions) = update.permissions {
            patch.insert("permissions".into(), json!(permissions));
        }
        patch.insert("version".into(), json!(expected_version + 1));

        let updated = self
            .db
            .update(
                TABLE,
                patch.into(),
                &[
                    Filter::eq("id", id),
                    Filter::eq("version", expected_version),
                ],
            )
            .await?;
        match restdb::maybe_single(updated) {
            Some(row) => Ok(to_domain(decode(TABLE, row)?)),
            None => Err(ServiceError::Conflict(format!("role '{}'", existing.code))),
        }
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let Some(existing) = self.get(id).await? else {
            return Ok(false);
        };
        if existing.is_system {
            return Err(ServiceError::Validation("Cannot delete system role".into()));
        }
        let removed = self.db.delete(TABLE, &[Filter::eq("id", id)]).await?;
        Ok(removed > 0)
    }
}
