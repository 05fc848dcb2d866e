//! Legal documents and user consent.
//!
//! Document versions move draft -> published -> archived. Publishing a
//! version makes it the current one for its document type and mirrors it to
//! local storage, so the consent screen can still render the current text
//! when the backend is unreachable. Reads of anything else fail like every
//! other service.

use crate::error::{Result, ServiceError};
use crate::services::{decode, decode_rows, maybe_decode};
use chrono::{DateTime, Utc};
use connstore::Db;
use localstore::PersistentStorage;
use restdb::{maybe_single, Filter, Querier, SelectQuery};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

const DOCUMENTS_TABLE: &str = "legal_documents";
const ACCEPTANCES_TABLE: &str = "legal_acceptances";

fn mirror_key(document_type: &str) -> String {
    format!("legal/current/{document_type}")
}

/// SHA-256 of the document body, stored alongside it so an acceptance can be
/// tied to the exact text that was shown.
pub fn content_checksum(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Draft,
    Published,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentVersion {
    pub id: String,
    pub document_type: String,
    pub version: String,
    pub title: String,
    pub content: String,
    pub checksum: String,
    pub status: DocumentStatus,
    pub is_current: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentRow {
    #[serde(default)]
    id: String,
    document_type: String,
    version: String,
    title: String,
    content: String,
    checksum: String,
    status: DocumentStatus,
    is_current: bool,
    published_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

fn to_domain(row: DocumentRow) -> DocumentVersion {
    DocumentVersion {
        id: row.id,
        document_type: row.document_type,
        version: row.version,
        title: row.title,
        content: row.content,
        checksum: row.checksum,
        status: row.status,
        is_current: row.is_current,
        published_at: row.published_at,
        created_at: row.created_at,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acceptance {
    pub id: String,
    pub user_id: String,
    pub document_version_id: String,
    pub checksum: String,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AcceptanceRow {
    #[serde(default)]
    id: String,
    user_id: String,
    document_version_id: String,
    checksum: String,
    accepted_at: DateTime<Utc>,
}

fn acceptance_to_domain(row: AcceptanceRow) -> Acceptance {
    Acceptance {
        id: row.id,
        user_id: row.user_id,
        document_version_id: row.document_version_id,
        checksum: row.checksum,
        accepted_at: row.accepted_at,
    }
}

#[derive(Clone)]
pub struct LegalService {
    db: Db,
    mirror: PersistentStorage,
}

impl LegalService {
    pub fn new(db: Db, mirror: PersistentStorage) -> Self {
        Self { db, mirror }
    }

    pub async fn versions(&self, document_type: &str) -> Result<Vec<DocumentVersion>> {
        let rows = self
            .db
            .select(
                DOCUMENTS_TABLE,
                &SelectQuery::new()
                    .eq("document_type", document_type)
                    .order_desc("created_at"),
            )
            .await?;
        Ok(decode_rows::<DocumentRow>(DOCUMENTS_TABLE, rows)?
            .into_iter()
            .map(to_domain)
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<DocumentVersion>> {
        let rows = self
            .db
            .select(DOCUMENTS_TABLE, &SelectQuery::new().eq("id", id).limit(1))
            .await?;
        maybe_decode::<DocumentRow>(DOCUMENTS_TABLE, rows).map(|row| row.map(to_domain))
    }

    /// Create a new draft version of a document type. The version string is
    /// caller-supplied and must be unique within the type.
    pub async fn create_draft(
        &self,
        document_type: &str,
        version: &str,
        title: &str,
        content: &str,
    ) -> Result<DocumentVersion> {
        if content.trim().is_empty() {
            return Err(ServiceError::Validation(
                "document content cannot be empty".into(),
            ));
        }
        if version.trim().is_empty() {
            return Err(ServiceError::Validation(
                "document version cannot be empty".into(),
            ));
        }
        let taken = self
            .db
            .count(
                DOCUMENTS_TABLE,
                &[
                    Filter::eq("document_type", document_type),
                    Filter::eq("version", version),
                ],
            )
            .await?;
        if taken > 0 {
            return Err(ServiceError::Validation(format!(
                "version '{version}' of '{document_type}' already exists"
            )));
        }

        let row = json!({
            "document_type": document_type,
            "version": version,
            "title": title,
            "content": content,
            "checksum": content_checksum(content),
            "status": "draft",
            "is_current": false,
            "published_at": null,
            "created_at": Utc::now(),
        });
        let inserted = self.db.insert(DOCUMENTS_TABLE, vec![row]).await?;
        let row: DocumentRow = decode(DOCUMENTS_TABLE, restdb::single(DOCUMENTS_TABLE, inserted)?)?;
        Ok(to_domain(row))
    }

    /// Rework a draft's text. Published and archived versions are immutable;
    /// changes to them go through a new draft.
    pub async fn update_draft(&self, id: &str, title: &str, content: &str) -> Result<DocumentVersion> {
        let version = self
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::Validation(format!("document version '{id}' not found")))?;
        if version.status != DocumentStatus::Draft {
            return Err(ServiceError::Validation(
                "only draft versions can be edited".into(),
            ));
        }
        if content.trim().is_empty() {
            return Err(ServiceError::Validation(
                "document content cannot be empty".into(),
            ));
        }

        let updated = self
            .db
            .update(
                DOCUMENTS_TABLE,
                json!({
                    "title": title,
                    "content": content,
                    "checksum": content_checksum(content),
                }),
                &[Filter::eq("id", id), Filter::eq("status", "draft")],
            )
            .await?;
        let row: DocumentRow = decode(DOCUMENTS_TABLE, restdb::single(DOCUMENTS_TABLE, updated)?)?;
        Ok(to_domain(row))
    }

    /// Publish a draft. The previously current version of the same type is
    /// archived, and the newly current version is mirrored locally.
    pub async fn publish(&self, id: &str) -> Result<DocumentVersion> {
        let version = self
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::Validation(format!("document version '{id}' not found")))?;
        if version.status != DocumentStatus::Draft {
            return Err(ServiceError::Validation(
                "only draft versions can be published".into(),
            ));
        }

        self.db
            .update(
                DOCUMENTS_TABLE,
                json!({ "status": "archived", "is_current": false }),
                &[
                    Filter::eq("document_type", version.document_type.as_str()),
                    Filter::eq("is_current", true),
                ],
            )
            .await?;

        let updated = self
            .db
            .update(
                DOCUMENTS_TABLE,
                json!({
                    "status": "published",
                    "is_current": true,
                    "published_at": Utc::now(),
                }),
                &[Filter::eq("id", id)],
            )
            .await?;
        let row: DocumentRow = decode(DOCUMENTS_TABLE, restdb::single(DOCUMENTS_TABLE, updated)?)?;

        if let Err(e) = self.mirror.save(&mirror_key(&row.document_type), &row) {
            tracing::warn!(error = %e, document_type = %row.document_type, "failed to mirror published document");
        }
        tracing::info!(
            document_type = %row.document_type,
            version = %row.version,
            "published legal document"
        );
        Ok(to_domain(row))
    }

    /// The current published version of a document type. This is the one
    /// read that degrades gracefully: every successful fetch refreshes the
    /// local mirror, and when the backend is unreachable the mirrored copy
    /// is returned instead.
    pub async fn current_version(&self, document_type: &str) -> Result<Option<DocumentVersion>> {
        let fetched = self
            .db
            .select(
                DOCUMENTS_TABLE,
                &SelectQuery::new()
                    .eq("document_type", document_type)
                    .eq("is_current", true)
                    .limit(1),
            )
            .await;
        match fetched {
            Ok(rows) => {
                let row = maybe_decode::<DocumentRow>(DOCUMENTS_TABLE, rows)?;
                if let Some(ref row) = row {
                    if let Err(e) = self.mirror.save(&mirror_key(document_type), row) {
                        tracing::warn!(error = %e, document_type, "failed to refresh mirrored legal document");
                    }
                }
                Ok(row.map(to_domain))
            }
            Err(e) => {
                tracing::warn!(error = %e, document_type, "falling back to mirrored legal document");
                let mirrored: Option<DocumentRow> =
                    self.mirror.load(&mirror_key(document_type), None);
                Ok(mirrored.map(to_domain))
            }
        }
    }

    /// Record a user's consent to a document version. Accepting the same
    /// version twice returns the original acceptance unchanged.
    pub async fn accept_document(&self, user_id: &str, version_id: &str) -> Result<Acceptance> {
        let version = self
            .get(version_id)
            .await?
            .ok_or_else(|| {
                ServiceError::Validation(format!("document version '{version_id}' not found"))
            })?;
        if version.status != DocumentStatus::Published {
            return Err(ServiceError::Validation(
                "only published versions can be accepted".into(),
            ));
        }

        if let Some(existing) = self.acceptance(user_id, version_id).await? {
            return Ok(existing);
        }

        let row = json!({
            "user_id": user_id,
            "document_version_id": version_id,
            "checksum": version.checksum,
            "accepted_at": Utc::now(),
        });
        let inserted = self.db.insert(ACCEPTANCES_TABLE, vec![row]).await?;
        let row: AcceptanceRow =
            decode(ACCEPTANCES_TABLE, restdb::single(ACCEPTANCES_TABLE, inserted)?)?;
        Ok(acceptance_to_domain(row))
    }

    pub async fn acceptance(
        &self,
        user_id: &str,
        version_id: &str,
    ) -> Result<Option<Acceptance>> {
        let rows = self
            .db
            .select(
                ACCEPTANCES_TABLE,
                &SelectQuery::new()
                    .eq("user_id", user_id)
                    .eq("document_version_id", version_id)
                    .limit(1),
            )
            .await?;
        maybe_decode::<AcceptanceRow>(ACCEPTANCES_TABLE, rows)
            .map(|row| row.map(acceptance_to_domain))
    }

    /// Whether the user has accepted the current version of a document type.
    /// No current version means there is nothing to accept.
    pub async fn has_accepted_current(
        &self,
        user_id: &str,
        document_type: &str,
    ) -> Result<bool> {
        let Some(current) = self.current_version(document_type).await? else {
            return Ok(true);
        };
        let rows = self
            .db
            .select(
                ACCEPTANCES_TABLE,
                &SelectQuery::new()
                    .columns("id")
                    .eq("user_id", user_id)
                    .eq("document_version_id", current.id.as_str())
                    .limit(1),
            )
            .await?;
        Ok(maybe_single(rows).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use restdb::MemoryQuerier;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<MemoryQuerier>, LegalService) {
        let dir = TempDir::new().unwrap();
        let querier = Arc::new(MemoryQuerier::new());
        let svc = LegalService::new(
            Db::fixed(querier.clone()),
            PersistentStorage::new(dir.path()),
        );
        (dir, querier, svc)
    }

    #[tokio::test]
    async fn publish_archives_previous_current() {
        let (_dir, _querier, svc) = setup();
        let v1 = svc
            .create_draft("terms", "1.0", "Terms v1", "first text")
            .await
            .unwrap();
        svc.publish(&v1.id).await.unwrap();

        let v2 = svc
            .create_draft("terms", "2.0", "Terms v2", "second text")
            .await
            .unwrap();
        assert_eq!(v2.version, "2.0");
        svc.publish(&v2.id).await.unwrap();

        let old = svc.get(&v1.id).await.unwrap().unwrap();
        assert_eq!(old.status, DocumentStatus::Archived);
        assert!(!old.is_current);

        let current = svc.current_version("terms").await.unwrap().unwrap();
        assert_eq!(current.id, v2.id);
    }

    #[tokio::test]
    async fn version_strings_are_unique_per_type() {
        let (_dir, _querier, svc) = setup();
        svc.create_draft("terms", "1.0", "Terms", "text")
            .await
            .unwrap();
        let err = svc
            .create_draft("terms", "1.0", "Terms again", "other text")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        // Same version string under another type is fine.
        svc.create_draft("privacy", "1.0", "Privacy", "text")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn only_drafts_can_be_edited() {
        let (_dir, _querier, svc) = setup();
        let draft = svc
            .create_draft("terms", "1.0", "Terms", "first wording")
            .await
            .unwrap();
        let edited = svc
            .update_draft(&draft.id, "Terms", "final wording")
            .await
            .unwrap();
        assert_eq!(edited.checksum, content_checksum("final wording"));

        svc.publish(&draft.id).await.unwrap();
        let err = svc
            .update_draft(&draft.id, "Terms", "too late")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn accept_is_idempotent() {
        let (_dir, querier, svc) = setup();
        let v1 = svc
            .create_draft("privacy", "1.0", "Privacy", "policy text")
            .await
            .unwrap();
        let v1 = svc.publish(&v1.id).await.unwrap();

        let first = svc.accept_document("u1", &v1.id).await.unwrap();
        let second = svc.accept_document("u1", &v1.id).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(querier.rows(ACCEPTANCES_TABLE).len(), 1);
        assert_eq!(first.checksum, content_checksum("policy text"));
    }

    #[tokio::test]
    async fn draft_cannot_be_accepted() {
        let (_dir, _querier, svc) = setup();
        let draft = svc
            .create_draft("terms", "1.0", "Terms", "draft text")
            .await
            .unwrap();
        let err = svc.accept_document("u1", &draft.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn has_accepted_current_tracks_republish() {
        let (_dir, _querier, svc) = setup();
        let v1 = svc
            .create_draft("terms", "1.0", "Terms v1", "first")
            .await
            .unwrap();
        let v1 = svc.publish(&v1.id).await.unwrap();
        svc.accept_document("u1", &v1.id).await.unwrap();
        assert!(svc.has_accepted_current("u1", "terms").await.unwrap());

        let v2 = svc
            .create_draft("terms", "2.0", "Terms v2", "second")
            .await
            .unwrap();
        svc.publish(&v2.id).await.unwrap();
        assert!(!svc.has_accepted_current("u1", "terms").await.unwrap());
    }

    #[test]
    fn checksum_is_stable_hex() {
        let sum = content_checksum("hello");
        assert_eq!(sum.len(), 64);
        assert_eq!(sum, content_checksum("hello"));
        assert_ne!(sum, content_checksum("hello!"));
    }
}
