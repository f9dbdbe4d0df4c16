use mongodb::bson::{DateTime, Document, doc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::MongoDaoError;
use crate::dao::models::{
    AnswerEntity, FailedUpdateEntity, FailedUpdateStatus, PlayerEntity, PlayerSummaryEntity,
    ResponseEntity, RosterEntry, SessionEntity, SessionSettings, SessionStatus, UpdateKind,
    UpdatePayload,
};

pub const PLAYER_COLLECTION: &str = "players";
pub const SESSION_COLLECTION: &str = "sessions";
pub const LEDGER_COLLECTION: &str = "failed_updates";

/// `_id` of a player row: rows of one session share the `{code}:` prefix.
pub fn player_key(code: &str, player_id: Uuid) -> String {
    format!("{code}:{player_id}")
}

/// Recover the player id from a `{code}:{player_id}` key.
pub fn player_id_from_key(key: &str) -> Option<Uuid> {
    key.split_once(':')
        .and_then(|(_, id)| Uuid::parse_str(id).ok())
}

fn to_u32(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}

fn bson_time(time: std::time::SystemTime) -> DateTime {
    DateTime::from_system_time(time)
}

fn parse_uuid(collection: &'static str, value: &str) -> Result<Uuid, MongoDaoError> {
    Uuid::parse_str(value).map_err(|err| MongoDaoError::InvalidDocument {
        collection,
        id: value.to_owned(),
        reason: err.to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoAnswerDocument {
    question_ref: String,
    option_ref: String,
    correct: bool,
    points: i64,
    answered_at: DateTime,
}

impl From<&AnswerEntity> for MongoAnswerDocument {
    fn from(value: &AnswerEntity) -> Self {
        Self {
            question_ref: value.question_ref.clone(),
            option_ref: value.option_ref.clone(),
            correct: value.correct,
            points: i64::from(value.points),
            answered_at: bson_time(value.answered_at),
        }
    }
}

impl From<MongoAnswerDocument> for AnswerEntity {
    fn from(value: MongoAnswerDocument) -> Self {
        Self {
            question_ref: value.question_ref,
            option_ref: value.option_ref,
            correct: value.correct,
            points: to_u32(value.points),
            answered_at: value.answered_at.to_system_time(),
        }
    }
}

/// Raw document pushed by the atomic answer append.
pub fn answer_document(answer: &AnswerEntity) -> Document {
    doc! {
        "question_ref": &answer.question_ref,
        "option_ref": &answer.option_ref,
        "correct": answer.correct,
        "points": i64::from(answer.points),
        "answered_at": bson_time(answer.answered_at),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoPlayerDocument {
    #[serde(rename = "_id")]
    key: String,
    session_code: String,
    player_id: String,
    name: String,
    avatar: Option<String>,
    score: i64,
    questions_answered: i64,
    is_host: bool,
    joined_at: DateTime,
    started_at: Option<DateTime>,
    ended_at: Option<DateTime>,
    #[serde(default)]
    answers: Vec<MongoAnswerDocument>,
    updated_at: DateTime,
}

impl From<&PlayerEntity> for MongoPlayerDocument {
    fn from(value: &PlayerEntity) -> Self {
        Self {
            key: player_key(&value.session_code, value.id),
            session_code: value.session_code.clone(),
            player_id: value.id.to_string(),
            name: value.name.clone(),
            avatar: value.avatar.clone(),
            score: i64::from(value.score),
            questions_answered: i64::from(value.questions_answered),
            is_host: value.is_host,
            joined_at: bson_time(value.joined_at),
            started_at: value.started_at.map(bson_time),
            ended_at: value.ended_at.map(bson_time),
            answers: value.answers.iter().map(Into::into).collect(),
            updated_at: bson_time(value.updated_at),
        }
    }
}

impl TryFrom<MongoPlayerDocument> for PlayerEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoPlayerDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(PLAYER_COLLECTION, &value.player_id)?,
            session_code: value.session_code,
            name: value.name,
            avatar: value.avatar,
            score: to_u32(value.score),
            questions_answered: to_u32(value.questions_answered),
            is_host: value.is_host,
            joined_at: value.joined_at.to_system_time(),
            started_at: value.started_at.map(|t| t.to_system_time()),
            ended_at: value.ended_at.map(|t| t.to_system_time()),
            answers: value.answers.into_iter().map(Into::into).collect(),
            updated_at: value.updated_at.to_system_time(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoRosterDocument {
    id: String,
    name: String,
    avatar: Option<String>,
    score: i64,
    questions_answered: i64,
    is_host: bool,
    joined_at: DateTime,
    started_at: Option<DateTime>,
    ended_at: Option<DateTime>,
}

impl From<&RosterEntry> for MongoRosterDocument {
    fn from(value: &RosterEntry) -> Self {
        Self {
            id: value.id.to_string(),
            name: value.name.clone(),
            avatar: value.avatar.clone(),
            score: i64::from(value.score),
            questions_answered: i64::from(value.questions_answered),
            is_host: value.is_host,
            joined_at: bson_time(value.joined_at),
            started_at: value.started_at.map(bson_time),
            ended_at: value.ended_at.map(bson_time),
        }
    }
}

impl TryFrom<MongoRosterDocument> for RosterEntry {
    type Error = MongoDaoError;

    fn try_from(value: MongoRosterDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(SESSION_COLLECTION, &value.id)?,
            name: value.name,
            avatar: value.avatar,
            score: to_u32(value.score),
            questions_answered: to_u32(value.questions_answered),
            is_host: value.is_host,
            joined_at: value.joined_at.to_system_time(),
            started_at: value.started_at.map(|t| t.to_system_time()),
            ended_at: value.ended_at.map(|t| t.to_system_time()),
        })
    }
}

/// Raw roster entry pushed by the mirror update.
pub fn roster_document(entry: &RosterEntry) -> Document {
    doc! {
        "id": entry.id.to_string(),
        "name": &entry.name,
        "avatar": entry.avatar.clone(),
        "score": i64::from(entry.score),
        "questions_answered": i64::from(entry.questions_answered),
        "is_host": entry.is_host,
        "joined_at": bson_time(entry.joined_at),
        "started_at": entry.started_at.map(bson_time),
        "ended_at": entry.ended_at.map(bson_time),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoResponseDocument {
    player_id: String,
    #[serde(flatten)]
    answer: MongoAnswerDocument,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSummaryDocument {
    player_id: String,
    name: String,
    answered: i64,
    correct: i64,
    accuracy_percent: i64,
    duration_ms: Option<i64>,
    final_score: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSettingsDocument {
    question_count: i64,
    time_limit_secs: i64,
    countdown_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSessionDocument {
    #[serde(rename = "_id")]
    code: String,
    session_id: String,
    host_id: String,
    host_name: String,
    settings: MongoSettingsDocument,
    status: SessionStatus,
    quiz_ref: String,
    created_at: DateTime,
    countdown_started_at: Option<DateTime>,
    countdown_duration_ms: Option<i64>,
    started_at: Option<DateTime>,
    ended_at: Option<DateTime>,
    #[serde(default)]
    roster: Vec<MongoRosterDocument>,
    #[serde(default)]
    responses: Vec<MongoResponseDocument>,
    #[serde(default)]
    summaries: Vec<MongoSummaryDocument>,
    updated_at: DateTime,
}

impl From<&SessionEntity> for MongoSessionDocument {
    fn from(value: &SessionEntity) -> Self {
        Self {
            code: value.code.clone(),
            session_id: value.id.to_string(),
            host_id: value.host_id.to_string(),
            host_name: value.host_name.clone(),
            settings: MongoSettingsDocument {
                question_count: i64::from(value.settings.question_count),
                time_limit_secs: i64::from(value.settings.time_limit_secs),
                countdown_secs: value.settings.countdown_secs.map(i64::from),
            },
            status: value.status,
            quiz_ref: value.quiz_ref.clone(),
            created_at: bson_time(value.created_at),
            countdown_started_at: value.countdown_started_at.map(bson_time),
            countdown_duration_ms: value
                .countdown_duration_ms
                .map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)),
            started_at: value.started_at.map(bson_time),
            ended_at: value.ended_at.map(bson_time),
            roster: value.roster.iter().map(Into::into).collect(),
            responses: value
                .responses
                .iter()
                .map(|response| MongoResponseDocument {
                    player_id: response.player_id.to_string(),
                    answer: MongoAnswerDocument {
                        question_ref: response.question_ref.clone(),
                        option_ref: response.option_ref.clone(),
                        correct: response.correct,
                        points: i64::from(response.points),
                        answered_at: bson_time(response.answered_at),
                    },
                })
                .collect(),
            summaries: value
                .summaries
                .iter()
                .map(|summary| MongoSummaryDocument {
                    player_id: summary.player_id.to_string(),
                    name: summary.name.clone(),
                    answered: i64::from(summary.answered),
                    correct: i64::from(summary.correct),
                    accuracy_percent: i64::from(summary.accuracy_percent),
                    duration_ms: summary
                        .duration_ms
                        .map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)),
                    final_score: i64::from(summary.final_score),
                })
                .collect(),
            updated_at: bson_time(value.updated_at),
        }
    }
}

impl TryFrom<MongoSessionDocument> for SessionEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoSessionDocument) -> Result<Self, Self::Error> {
        let roster = value
            .roster
            .into_iter()
            .map(RosterEntry::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let responses = value
            .responses
            .into_iter()
            .map(|response| {
                let answer = AnswerEntity::from(response.answer);
                Ok(ResponseEntity::from_answer(
                    parse_uuid(SESSION_COLLECTION, &response.player_id)?,
                    &answer,
                ))
            })
            .collect::<Result<Vec<_>, MongoDaoError>>()?;
        let summaries = value
            .summaries
            .into_iter()
            .map(|summary| {
                Ok(PlayerSummaryEntity {
                    player_id: parse_uuid(SESSION_COLLECTION, &summary.player_id)?,
                    name: summary.name,
                    answered: to_u32(summary.answered),
                    correct: to_u32(summary.correct),
                    accuracy_percent: to_u32(summary.accuracy_percent),
                    duration_ms: summary.duration_ms.map(|ms| ms.max(0) as u64),
                    final_score: to_u32(summary.final_score),
                })
            })
            .collect::<Result<Vec<_>, MongoDaoError>>()?;

        Ok(Self {
            id: parse_uuid(SESSION_COLLECTION, &value.session_id)?,
            code: value.code,
            host_id: parse_uuid(SESSION_COLLECTION, &value.host_id)?,
            host_name: value.host_name,
            settings: SessionSettings {
                question_count: to_u32(value.settings.question_count),
                time_limit_secs: to_u32(value.settings.time_limit_secs),
                countdown_secs: value.settings.countdown_secs.map(to_u32),
            },
            status: value.status,
            quiz_ref: value.quiz_ref,
            created_at: value.created_at.to_system_time(),
            countdown_started_at: value.countdown_started_at.map(|t| t.to_system_time()),
            countdown_duration_ms: value.countdown_duration_ms.map(|ms| ms.max(0) as u64),
            started_at: value.started_at.map(|t| t.to_system_time()),
            ended_at: value.ended_at.map(|t| t.to_system_time()),
            roster,
            responses,
            summaries,
            updated_at: value.updated_at.to_system_time(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoFailedUpdateDocument {
    #[serde(rename = "_id")]
    id: String,
    session_code: String,
    player_id: String,
    kind: UpdateKind,
    payload: UpdatePayload,
    attempts: i64,
    max_attempts: i64,
    status: FailedUpdateStatus,
    last_error: Option<String>,
    created_at: DateTime,
    updated_at: DateTime,
    next_attempt_at: DateTime,
}

impl From<&FailedUpdateEntity> for MongoFailedUpdateDocument {
    fn from(value: &FailedUpdateEntity) -> Self {
        Self {
            id: value.id.to_string(),
            session_code: value.session_code.clone(),
            player_id: value.player_id.to_string(),
            kind: value.kind,
            payload: value.payload.clone(),
            attempts: i64::from(value.attempts),
            max_attempts: i64::from(value.max_attempts),
            status: value.status,
            last_error: value.last_error.clone(),
            created_at: bson_time(value.created_at),
            updated_at: bson_time(value.updated_at),
            next_attempt_at: bson_time(value.next_attempt_at),
        }
    }
}

impl TryFrom<MongoFailedUpdateDocument> for FailedUpdateEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoFailedUpdateDocument) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(LEDGER_COLLECTION, &value.id)?,
            session_code: value.session_code,
            player_id: parse_uuid(LEDGER_COLLECTION, &value.player_id)?,
            kind: value.kind,
            payload: value.payload,
            attempts: to_u32(value.attempts),
            max_attempts: to_u32(value.max_attempts),
            status: value.status,
            last_error: value.last_error,
            created_at: value.created_at.to_system_time(),
            updated_at: value.updated_at.to_system_time(),
            next_attempt_at: value.next_attempt_at.to_system_time(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_key_round_trips_the_id() {
        let id = Uuid::new_v4();
        let key = player_key("123456", id);
        assert!(key.starts_with("123456:"));
        assert_eq!(player_id_from_key(&key), Some(id));
        assert_eq!(player_id_from_key("garbage"), None);
    }

    #[test]
    fn negative_counters_clamp_to_zero() {
        assert_eq!(to_u32(-4), 0);
        assert_eq!(to_u32(i64::MAX), u32::MAX);
    }
}
