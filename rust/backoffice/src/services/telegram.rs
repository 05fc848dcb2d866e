//! Telegram account linking via short-lived verification codes.
//!
//! A user starts verification and receives a 6-digit code; entering the code
//! in the Telegram bot confirms the link and records the chat id the bot
//! should message from then on. Codes are single-use and expire after
//! [`CODE_TTL_MINUTES`].

use crate::error::{Result, ServiceError};
use crate::services::{decode, maybe_decode};
use chrono::{DateTime, Duration, Utc};
use connstore::Db;
use rand::Rng;
use restdb::{Filter, Querier, SelectQuery};
use serde::{Deserialize, Serialize};
use serde_json::json;

const TABLE: &str = "telegram_verifications";

pub const CODE_TTL_MINUTES: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub id: String,
    pub user_id: String,
    pub code: String,
    pub chat_id: Option<i64>,
    pub is_used: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VerificationRow {
    #[serde(default)]
    id: String,
    user_id: String,
    code: String,
    chat_id: Option<i64>,
    is_used: bool,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

fn to_domain(row: VerificationRow) -> Verification {
    Verification {
        id: row.id,
        user_id: row.user_id,
        code: row.code,
        chat_id: row.chat_id,
        is_used: row.is_used,
        expires_at: row.expires_at,
        created_at: row.created_at,
    }
}

#[derive(Clone)]
pub struct TelegramService {
    db: Db,
}

impl TelegramService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Issue a fresh verification code for a user. Any earlier pending codes
    /// for the same user are invalidated so only the newest one works.
    pub async fn start_verification(&self, user_id: &str) -> Result<Verification> {
        self.db
            .update(
                TABLE,
                json!({ "is_used": true }),
                &[Filter::eq("user_id", user_id), Filter::eq("is_used", false)],
            )
            .await?;

        let code = format!("{}", rand::thread_rng().gen_range(100_000..=999_999));
        let now = Utc::now();
        let row = json!({
            "user_id": user_id,
            "code": code,
            "chat_id": null,
            "is_used": false,
            "expires_at": now + Duration::minutes(CODE_TTL_MINUTES),
            "created_at": now,
        });
        let inserted = self.db.insert(TABLE, vec![row]).await?;
        let row: VerificationRow = decode(TABLE, restdb::single(TABLE, inserted)?)?;
        tracing::info!(user_id, "telegram verification started");
        Ok(to_domain(row))
    }

    /// Confirm a code sent to the bot from `chat_id`. On success the code is
    /// consumed, the chat id is stored, and the linked user id is returned.
    pub async fn confirm(&self, code: &str, chat_id: i64) -> Result<String> {
        let rows = self
            .db
            .select(
                TABLE,
                &SelectQuery::new()
                    .eq("code", code)
                    .eq("is_used", false)
                    .limit(1),
            )
            .await?;
        let pending = maybe_decode::<VerificationRow>(TABLE, rows)?
            .ok_or_else(|| ServiceError::Validation("invalid or already used code".into()))?;

        if pending.expires_at <= Utc::now() {
            return Err(ServiceError::Validation("verification code has expired".into()));
        }

        self.db
            .update(
                TABLE,
                json!({ "is_used": true, "chat_id": chat_id }),
                &[Filter::eq("id", pending.id.as_str())],
            )
            .await?;

        tracing::info!(user_id = %pending.user_id, "telegram account linked");
        Ok(pending.user_id)
    }

    /// The chat id of a user's confirmed link, if any. The newest confirmed
    /// verification wins.
    pub async fn chat_id_for(&self, user_id: &str) -> Result<Option<i64>> {
        let rows = self
            .db
            .select(
                TABLE,
                &SelectQuery::new()
                    .eq("user_id", user_id)
                    .eq("is_used", true)
                    .neq("chat_id", serde_json::Value::Null)
                    .order_desc("created_at")
                    .limit(1),
            )
            .await?;
        Ok(maybe_decode::<VerificationRow>(TABLE, rows)?.and_then(|row| row.chat_id))
    }
}
