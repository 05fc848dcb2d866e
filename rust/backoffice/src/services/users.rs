//! Back-office users and their role assignments.

use crate::error::{Result, ServiceError};
use crate::services::roles::{RoleService, SUPER_ADMIN_ROLE};
use crate::services::{decode, decode_rows, encode, maybe_decode};
use chrono::{DateTime, Utc};
use connstore::Db;
use restdb::{Filter, Querier, SelectQuery};
use serde::{Deserialize, Serialize};
use serde_json::json;

const TABLE: &str = "users";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Inactive,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentScope {
    Global,
    Network,
    Point,
    Assigned,
}

/// One role held by a user, with the scope it applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssignment {
    pub role_code: String,
    pub scope: AssignmentScope,
    pub scope_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub status: UserStatus,
    pub roles: Vec<RoleAssignment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn is_super_admin(&self) -> bool {
        self.roles.iter().any(|r| r.role_code == SUPER_ADMIN_ROLE)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UserRow {
    #[serde(default)]
    id: String,
    email: String,
    name: String,
    phone: Option<String>,
    status: UserStatus,
    roles: Vec<RoleAssignment>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn to_domain(row: UserRow) -> User {
    User {
        id: row.id,
        email: row.email,
        name: row.name,
        phone: row.phone,
        status: row.status,
        roles: row.roles,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub phone: Option<String>,
    pub roles: Vec<RoleAssignment>,
}

#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub phone: Option<Option<String>>,
    pub roles: Option<Vec<RoleAssignment>>,
}

#[derive(Clone)]
pub struct UserService {
    db: Db,
    roles: RoleService,
}

impl UserService {
    pub fn new(db: Db) -> Self {
        let roles = RoleService::new(db.clone());
        Self { db, roles }
    }

    pub async fn list(&self) -> Result<Vec<User>> {
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().order("email"))
            .await?;
        Ok(decode_rows::<UserRow>(TABLE, rows)?
            .into_iter()
            .map(to_domain)
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<User>> {
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().eq("id", id).limit(1))
            .await?;
        maybe_decode::<UserRow>(TABLE, rows).map(|row| row.map(to_domain))
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let rows = self
            .db
            .select(
                TABLE,
                &SelectQuery::new()
                    .eq("email", email.to_lowercase())
                    .limit(1),
            )
            .await?;
        maybe_decode::<UserRow>(TABLE, rows).map(|row| row.map(to_domain))
    }

    pub async fn create(&self, input: NewUser) -> Result<User> {
        let email = input.email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(ServiceError::Validation("a valid email is required".into()));
        }
        if self.find_by_email(&email).await?.is_some() {
            return Err(ServiceError::Validation(format!(
                "user with email '{email}' already exists"
            )));
        }

        let now = Utc::now();
        let row = json!({
            "email": email,
            "name": input.name,
            "phone": input.phone,
            "status": "active",
            "roles": input.roles,
            "created_at": now,
            "updated_at": now,
        });
        let inserted = self.db.insert(TABLE, vec![row]).await?;
        let row: UserRow = decode(TABLE, restdb::single(TABLE, inserted)?)?;
        tracing::info!(user_id = %row.id, "created user");
        Ok(to_domain(row))
    }

    pub async fn update(&self, id: &str, update: UserUpdate) -> Result<Option<User>> {
        let mut patch = serde_json::Map::new();
        if let Some(name) = update.name {
            patch.insert("name".into(), json!(name));
        }
        if let Some(phone) = update.phone {
            patch.insert("phone".into(), json!(phone));
        }
        if let Some(roles) = update.roles {
            patch.insert("roles".into(), encode(&roles)?);
        }
        patch.insert("updated_at".into(), json!(Utc::now()));

        let updated = self
            .db
            .update(TABLE, patch.into(), &[Filter::eq("id", id)])
            .await?;
        maybe_decode::<UserRow>(TABLE, updated).map(|row| row.map(to_domain))
    }

    /// Change a user's status. Taking the last active super administrator
    /// out of service is refused.
    pub async fn set_status(&self, id: &str, status: UserStatus) -> Result<Option<User>> {
        if status != UserStatus::Active {
            self.guard_last_super_admin(id).await?;
        }
        let updated = self
            .db
            .update(
                TABLE,
                json!({ "status": encode(&status)?, "updated_at": Utc::now() }),
                &[Filter::eq("id", id)],
            )
            .await?;
        maybe_decode::<UserRow>(TABLE, updated).map(|row| row.map(to_domain))
    }

    /// Delete a user. The last active super administrator cannot be
    /// deleted.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.guard_last_super_admin(id).await?;
        let removed = self.db.delete(TABLE, &[Filter::eq("id", id)]).await?;
        Ok(removed > 0)
    }

    /// Effective permissions: the union of the permission lists of every
    /// role the user holds.
    pub async fn permissions(&self, id: &str) -> Result<Vec<String>> {
        let Some(user) = self.get(id).await? else {
            return Ok(Vec::new());
        };
        let codes: Vec<String> = user.roles.iter().map(|r| r.role_code.clone()).collect();
        let roles = self.roles.roles_by_codes(&codes).await?;

        let mut permissions: Vec<String> = roles
            .into_iter()
            .flat_map(|role| role.permissions)
            .collect();
        permissions.sort();
        permissions.dedup();
        Ok(permissions)
    }

    async fn guard_last_super_admin(&self, id: &str) -> Result<()> {
        let Some(target) = self.get(id).await? else {
            return Ok(());
        };
        if target.status != UserStatus::Active || !target.is_super_admin() {
            return Ok(());
        }

        // Role assignments live in a JSON column, so the count is taken by
        // lookup rather than by a backend filter.
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().eq("status", "active"))
            .await?;
        let admins = decode_rows::<UserRow>(TABLE, rows)?
            .into_iter()
            .map(to_domain)
            .filter(|u| u.is_super_admin())
            .count();
        if admins <= 1 {
            return Err(ServiceError::Validation(
                "Cannot remove the last active super administrator".into(),
            ));
        }
        Ok(())
    }
}
