use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dao::models::SessionEntity;

pub const SESSION_PREFIX: &str = "session::";
pub const END_SUFFIX: &str = "\u{ffff}";

pub fn session_doc_id(code: &str) -> String {
    format!("{SESSION_PREFIX}{code}")
}

#[derive(Debug, Deserialize)]
pub struct AllDocsResponse {
    pub rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
pub struct AllDocsRow {
    #[allow(dead_code)]
    pub id: String,
    #[serde(default)]
    pub doc: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ChangesRequest<'a> {
    pub doc_ids: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
pub struct ChangesResponse {
    #[serde(default)]
    pub results: Vec<ChangeRow>,
    pub last_seq: Value,
}

#[derive(Debug, Deserialize)]
pub struct ChangeRow {
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub doc: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct RevisionOnly {
    #[serde(rename = "_rev")]
    pub rev: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchSessionDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(flatten)]
    pub session: SessionEntity,
}

impl CouchSessionDocument {
    pub fn from_entity(session: SessionEntity, rev: Option<String>) -> Self {
        Self {
            id: session_doc_id(&session.code),
            rev,
            session,
        }
    }

    pub fn into_entity(self) -> SessionEntity {
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::models::{PlayerEntity, SessionSettings};
    use uuid::Uuid;

    #[test]
    fn document_keeps_couch_metadata_beside_the_session() {
        let host = PlayerEntity::new(Uuid::new_v4(), "123456", "host", None, true);
        let session = SessionEntity::new(
            "123456",
            &host,
            SessionSettings {
                question_count: 5,
                time_limit_secs: 20,
                countdown_secs: None,
            },
            "quiz",
        );
        let document = CouchSessionDocument::from_entity(session.clone(), Some("1-a".into()));
        let json = serde_json::to_value(&document).unwrap();
        assert_eq!(json["_id"], "session::123456");
        assert_eq!(json["_rev"], "1-a");
        assert_eq!(json["code"], "123456");

        let parsed: CouchSessionDocument = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.into_entity(), session);
    }
}
