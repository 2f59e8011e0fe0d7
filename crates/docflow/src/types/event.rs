//! Event payloads carried on the event channel

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::document::Document;

/// Primary topics
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Uploaded,
    Indexed,
    Deleted,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Uploaded, Topic::Indexed, Topic::Deleted];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Indexed => "indexed",
            Self::Deleted => "deleted",
        }
    }

    /// Name of the companion dead-letter topic
    pub fn dead_letter(&self) -> String {
        dead_letter_topic(self.as_str())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

/// `<topic>-dlq`
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{}-dlq", topic)
}

/// Emitted once per successful upload; everything the indexer needs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestionEvent {
    pub document_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub uploader_id: String,
    #[serde(default)]
    pub collection_id: Option<String>,
    pub mime_type: String,
    pub storage_locator: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Document> for IngestionEvent {
    fn from(doc: &Document) -> Self {
        Self {
            document_id: doc.id,
            title: doc.title.clone(),
            description: doc.description.clone(),
            uploader_id: doc.uploader_id.clone(),
            collection_id: doc.collection_id.clone(),
            mime_type: doc.mime_type.clone(),
            storage_locator: doc.storage_locator.clone(),
            created_at: doc.created_at,
        }
    }
}

/// Published after a document became searchable
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexedEvent {
    pub document_id: Uuid,
    /// Which extraction path produced the indexed text
    pub provenance: String,
    pub text_length: usize,
    pub attempts: u32,
    pub indexed_at: DateTime<Utc>,
}

/// Published after a document was removed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeletedEvent {
    pub document_id: Uuid,
    pub storage_locator: String,
    pub deleted_at: DateTime<Utc>,
}

/// Envelope written to a dead-letter topic
///
/// `payload` is the original message value, untouched, so it can be replayed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    /// Primary topic the payload came from
    pub topic: String,
    pub key: String,
    pub payload: serde_json::Value,
    pub reason: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::Uploaded.dead_letter(), "uploaded-dlq");
        assert_eq!(Topic::parse("deleted"), Some(Topic::Deleted));
        assert_eq!(Topic::parse("uploaded-dlq"), None);
    }

    #[test]
    fn test_ingestion_event_wire_format() {
        let event = IngestionEvent {
            document_id: Uuid::nil(),
            title: "Report".into(),
            description: None,
            uploader_id: "u1".into(),
            collection_id: None,
            mime_type: "text/plain".into(),
            storage_locator: "objects/aa/bb/aabb".into(),
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        for field in [
            "document_id",
            "title",
            "description",
            "uploader_id",
            "mime_type",
            "storage_locator",
            "created_at",
        ] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
    }
}
