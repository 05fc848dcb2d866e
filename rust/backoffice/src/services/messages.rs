//! In-app messages to back-office users.

use crate::error::{Result, ServiceError};
use crate::services::{decode, decode_rows, maybe_decode};
use chrono::{DateTime, Utc};
use connstore::Db;
use restdb::{Filter, Querier, SelectQuery};
use serde::{Deserialize, Serialize};
use serde_json::json;

const TABLE: &str = "messages";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub recipient_id: String,
    pub sender_id: Option<String>,
    pub severity: Severity,
    pub subject: String,
    pub body: String,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MessageRow {
    #[serde(default)]
    id: String,
    recipient_id: String,
    sender_id: Option<String>,
    severity: Severity,
    subject: String,
    body: String,
    is_read: bool,
    read_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

fn to_domain(row: MessageRow) -> Message {
    Message {
        id: row.id,
        recipient_id: row.recipient_id,
        sender_id: row.sender_id,
        severity: row.severity,
        subject: row.subject,
        body: row.body,
        is_read: row.is_read,
        read_at: row.read_at,
        created_at: row.created_at,
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: Option<String>,
    pub severity: Severity,
    pub subject: String,
    pub body: String,
}

#[derive(Clone)]
pub struct MessageService {
    db: Db,
}

impl MessageService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn send(&self, recipient_id: &str, message: NewMessage) -> Result<Message> {
        if message.subject.trim().is_empty() {
            return Err(ServiceError::Validation("message subject is required".into()));
        }

        let row = message_row(recipient_id, &message);
        let inserted = self.db.insert(TABLE, vec![row]).await?;
        let row: MessageRow = decode(TABLE, restdb::single(TABLE, inserted)?)?;
        Ok(to_domain(row))
    }

    /// Deliver one message to many recipients in a single insert.
    pub async fn send_broadcast(
        &self,
        recipient_ids: &[String],
        message: NewMessage,
    ) -> Result<u64> {
        if message.subject.trim().is_empty() {
            return Err(ServiceError::Validation("message subject is required".into()));
        }
        if recipient_ids.is_empty() {
            return Ok(0);
        }

        let rows: Vec<_> = recipient_ids
            .iter()
            .map(|recipient| message_row(recipient, &message))
            .collect();
        let inserted = self.db.insert(TABLE, rows).await?;
        tracing::info!(recipients = recipient_ids.len(), "broadcast message sent");
        Ok(inserted.len() as u64)
    }

    /// A user's messages, newest first. `unread_only` narrows to unread,
    /// `limit` caps the page.
    pub async fn inbox(
        &self,
        recipient_id: &str,
        unread_only: bool,
        limit: Option<u64>,
    ) -> Result<Vec<Message>> {
        let mut query = SelectQuery::new()
            .eq("recipient_id", recipient_id)
            .order_desc("created_at");
        if unread_only {
            query = query.eq("is_read", false);
        }
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        let rows = self.db.select(TABLE, &query).await?;
        Ok(decode_rows::<MessageRow>(TABLE, rows)?
            .into_iter()
            .map(to_domain)
            .collect())
    }

    pub async fn mark_read(&self, id: &str) -> Result<Option<Message>> {
        let updated = self
            .db
            .update(
                TABLE,
                json!({ "is_read": true, "read_at": Utc::now() }),
                &[Filter::eq("id", id), Filter::eq("is_read", false)],
            )
            .await?;
        if updated.is_empty() {
            // Already read, or unknown id.
            return self.get(id).await;
        }
        maybe_decode::<MessageRow>(TABLE, updated).map(|row| row.map(to_domain))
    }

    pub async fn mark_all_read(&self, recipient_id: &str) -> Result<u64> {
        let updated = self
            .db
            .update(
                TABLE,
                json!({ "is_read": true, "read_at": Utc::now() }),
                &[
                    Filter::eq("recipient_id", recipient_id),
                    Filter::eq("is_read", false),
                ],
            )
            .await?;
        Ok(updated.len() as u64)
    }

    pub async fn unread_count(&self, recipient_id: &str) -> Result<u64> {
        self.db
            .count(
                TABLE,
                &[
                    Filter::eq("recipient_id", recipient_id),
                    Filter::eq("is_read", false),
                ],
            )
            .await
            .map_err(Into::into)
    }

    async fn get(&self, id: &str) -> Result<Option<Message>> {
        let rows = self
            .db
            .select(TABLE, &SelectQuery::new().eq("id", id).limit(1))
            .await?;
        maybe_decode::<MessageRow>(TABLE, rows).map(|row| row.map(to_domain))
    }
}

fn message_row(recipient_id: &str, message: &NewMessage) -> serde_json::Value {
    json!({
        "recipient_id": recipient_id,
        "sender_id": message.sender_id,
        "severity": message.severity,
        "subject": message.subject,
        "body": message.body,
        "is_read": false,
        "read_at": null,
        "created_at": Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use restdb::MemoryQuerier;
    use std::sync::Arc;

    fn service() -> MessageService {
        MessageService::new(Db::fixed(Arc::new(MemoryQuerier::new())))
    }

    fn notice(subject: &str) -> NewMessage {
        NewMessage {
            sender_id: Some("admin".into()),
            severity: Severity::Info,
            subject: subject.into(),
            body: "body".into(),
        }
    }

    #[tokio::test]
    async fn inbox_and_unread_count() {
        let svc = service();
        svc.send("u1", notice("first")).await.unwrap();
        let second = svc.send("u1", notice("second")).await.unwrap();
        svc.send("u2", notice("other")).await.unwrap();

        assert_eq!(svc.unread_count("u1").await.unwrap(), 2);

        svc.mark_read(&second.id).await.unwrap();
        assert_eq!(svc.unread_count("u1").await.unwrap(), 1);
        assert_eq!(svc.inbox("u1", true, None).await.unwrap().len(), 1);
        assert_eq!(svc.inbox("u1", false, None).await.unwrap().len(), 2);
        assert_eq!(svc.inbox("u1", false, Some(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_read_is_idempotent() {
        let svc = service();
        let msg = svc.send("u1", notice("hello")).await.unwrap();

        let first = svc.mark_read(&msg.id).await.unwrap().unwrap();
        assert!(first.is_read);
        let read_at = first.read_at;

        let again = svc.mark_read(&msg.id).await.unwrap().unwrap();
        assert!(again.is_read);
        assert_eq!(again.read_at, read_at, "second mark keeps the first timestamp");
    }

    #[tokio::test]
    async fn broadcast_reaches_each_recipient() {
        let svc = service();
        let recipients = vec!["u1".to_string(), "u2".to_string(), "u3".to_string()];
        let delivered = svc
            .send_broadcast(&recipients, notice("maintenance window"))
            .await
            .unwrap();
        assert_eq!(delivered, 3);
        for user in &recipients {
            assert_eq!(svc.unread_count(user).await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn mark_all_read_clears_the_inbox() {
        let svc = service();
        svc.send("u1", notice("a")).await.unwrap();
        svc.send("u1", notice("b")).await.unwrap();

        assert_eq!(svc.mark_all_read("u1").await.unwrap(), 2);
        assert_eq!(svc.unread_count("u1").await.unwrap(), 0);
        // Nothing left to mark.
        assert_eq!(svc.mark_all_read("u1").await.unwrap(), 0);
    }
}
