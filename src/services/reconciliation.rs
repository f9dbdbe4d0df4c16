//! End-of-game reconciliation: fold the fast-store rows into the authoritative session document.
//!
//! The fold is pure and idempotent. Running it again over its own output, with the same or newer
//! fast-store rows, never loses roster players, never regresses progress and never duplicates a
//! response.

use std::{collections::HashSet, time::SystemTime};

use uuid::Uuid;

use crate::dao::models::{
    PlayerEntity, PlayerSummaryEntity, ResponseEntity, RosterEntry, SessionEntity,
};

/// Roster, response history and summaries produced by one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// Final roster, one entry per fast-store player.
    pub roster: Vec<RosterEntry>,
    /// Every recorded answer, in player then answer order.
    pub responses: Vec<ResponseEntity>,
    /// Per-player accuracy and timing.
    pub summaries: Vec<PlayerSummaryEntity>,
}

impl Reconciled {
    /// Write the result into the session document.
    pub fn apply(self, session: &mut SessionEntity, at: SystemTime) {
        session.roster = self.roster;
        session.responses = self.responses;
        session.summaries = self.summaries;
        session.updated_at = at;
    }
}

/// Merge `players` into the session's roster and recompute responses and summaries.
///
/// `ended_at` closes the duration of players that have no end timestamp of their own.
pub fn reconcile(
    session: &SessionEntity,
    players: &[PlayerEntity],
    ended_at: SystemTime,
) -> Reconciled {
    let roster = merge_roster(&session.roster, players);
    let responses = merge_responses(&session.responses, players);
    let summaries = roster
        .iter()
        .filter(|entry| !entry.is_host)
        .map(|entry| summarize(entry, &responses, ended_at))
        .collect();

    Reconciled {
        roster,
        responses,
        summaries,
    }
}

fn merge_roster(existing: &[RosterEntry], players: &[PlayerEntity]) -> Vec<RosterEntry> {
    let mut roster = existing.to_vec();
    for player in players {
        match roster.iter_mut().find(|entry| entry.id == player.id) {
            Some(entry) => {
                entry.merge_progress(player.progress());
                entry.name = player.name.clone();
                entry.avatar = player.avatar.clone();
                entry.started_at = entry.started_at.or(player.started_at);
                entry.ended_at = entry.ended_at.or(player.ended_at);
            }
            None => roster.push(RosterEntry::from(player)),
        }
    }
    roster
}

fn merge_responses(existing: &[ResponseEntity], players: &[PlayerEntity]) -> Vec<ResponseEntity> {
    let mut seen: HashSet<(Uuid, String)> = existing
        .iter()
        .map(|response| (response.player_id, response.question_ref.clone()))
        .collect();
    let mut responses = existing.to_vec();

    for player in players {
        for answer in &player.answers {
            if seen.insert((player.id, answer.question_ref.clone())) {
                responses.push(ResponseEntity::from_answer(player.id, answer));
            }
        }
    }
    responses
}

fn summarize(
    entry: &RosterEntry,
    responses: &[ResponseEntity],
    ended_at: SystemTime,
) -> PlayerSummaryEntity {
    let (recorded, correct) = responses
        .iter()
        .filter(|response| response.player_id == entry.id)
        .fold((0u32, 0u32), |(recorded, correct), response| {
            (recorded + 1, correct + u32::from(response.correct))
        });

    // Scores reported without answers still count as answered questions.
    let answered = if recorded > 0 {
        recorded
    } else {
        entry.questions_answered
    };

    let start = entry.started_at.unwrap_or(entry.joined_at);
    let end = entry.ended_at.unwrap_or(ended_at);
    let duration_ms = end
        .duration_since(start)
        .ok()
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));

    PlayerSummaryEntity {
        player_id: entry.id,
        name: entry.name.clone(),
        answered,
        correct,
        accuracy_percent: accuracy_percent(correct, answered),
        duration_ms,
        final_score: entry.score,
    }
}

/// Rounded percentage of correct answers; zero when nothing was answered.
pub fn accuracy_percent(correct: u32, answered: u32) -> u32 {
    if answered == 0 {
        return 0;
    }
    let correct = u64::from(correct.min(answered));
    let answered = u64::from(answered);
    ((correct * 200 + answered) / (answered * 2)) as u32
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dao::models::{AnswerEntity, SessionSettings};

    fn answer(question: &str, correct: bool) -> AnswerEntity {
        AnswerEntity {
            question_ref: question.into(),
            option_ref: "a".into(),
            correct,
            points: if correct { 100 } else { 0 },
            answered_at: SystemTime::now(),
        }
    }

    fn fixture() -> (SessionEntity, Vec<PlayerEntity>) {
        let host = PlayerEntity::new(Uuid::new_v4(), "123456", "host", None, true);
        let session = SessionEntity::new(
            "123456",
            &host,
            SessionSettings {
                question_count: 3,
                time_limit_secs: 20,
                countdown_secs: None,
            },
            "quiz",
        );

        let mut ada = PlayerEntity::new(Uuid::new_v4(), "123456", "ada", None, false);
        ada.append_answer(answer("q1", true), 3);
        ada.append_answer(answer("q2", false), 3);
        ada.append_answer(answer("q3", true), 3);
        ada.started_at = Some(SystemTime::now() - Duration::from_secs(30));

        let bob = PlayerEntity::new(Uuid::new_v4(), "123456", "bob", None, false);
        (session, vec![host, ada, bob])
    }

    #[test]
    fn accuracy_rounds_half_up() {
        assert_eq!(accuracy_percent(2, 3), 67);
        assert_eq!(accuracy_percent(1, 3), 33);
        assert_eq!(accuracy_percent(1, 8), 13);
        assert_eq!(accuracy_percent(0, 0), 0);
        assert_eq!(accuracy_percent(5, 5), 100);
    }

    #[test]
    fn summaries_cover_every_non_host_player() {
        let (session, players) = fixture();
        let reconciled = reconcile(&session, &players, SystemTime::now());

        assert_eq!(reconciled.roster.len(), 3);
        assert_eq!(reconciled.responses.len(), 3);
        assert_eq!(reconciled.summaries.len(), 2);

        let ada = &reconciled.summaries[0];
        assert_eq!(ada.name, "ada");
        assert_eq!(ada.answered, 3);
        assert_eq!(ada.correct, 2);
        assert_eq!(ada.accuracy_percent, 67);
        assert_eq!(ada.final_score, 200);
        assert!(ada.duration_ms.unwrap_or(0) >= 30_000);
    }

    #[test]
    fn running_twice_is_idempotent() {
        let (mut session, players) = fixture();
        let ended_at = SystemTime::now();

        reconcile(&session, &players, ended_at).apply(&mut session, ended_at);
        let first = session.clone();
        reconcile(&session, &players, ended_at).apply(&mut session, ended_at);

        assert_eq!(session.roster, first.roster);
        assert_eq!(session.responses, first.responses);
        assert_eq!(session.summaries, first.summaries);
    }

    #[test]
    fn roster_players_missing_from_fast_store_are_kept() {
        let (mut session, players) = fixture();
        let ended_at = SystemTime::now();
        reconcile(&session, &players, ended_at).apply(&mut session, ended_at);

        // Fast rows were purged: a second pass must not shrink the roster or regress scores.
        let again = reconcile(&session, &[], ended_at);
        assert_eq!(again.roster.len(), 3);
        assert_eq!(again.responses.len(), 3);
        let ada = again.roster.iter().find(|e| e.name == "ada").unwrap();
        assert_eq!(ada.score, 200);
    }
}
