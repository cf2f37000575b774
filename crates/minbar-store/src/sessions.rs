use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use minbar_core::window::SessionSummary;

use crate::database::{now_string, parse_ts, parse_uuid, Database};
use crate::error::{Result, StoreError};
use crate::users::UserRepo;

#[derive(Clone, Debug, PartialEq)]
pub struct SessionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub summary: Option<String>,
    /// Highest turn the Syncer has committed for this session.
    pub max_turn: u64,
    /// Highest turn covered by the stored summary.
    pub summarized_turn: u64,
    pub last_accessed: DateTime<Utc>,
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<(String, String, Option<String>, i64, i64, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_session(
    (id, user_id, summary, max_turn, summarized_turn, last_accessed): (
        String,
        String,
        Option<String>,
        i64,
        i64,
        String,
    ),
) -> Result<SessionRow> {
    Ok(SessionRow {
        id: parse_uuid(&id)?,
        user_id: parse_uuid(&user_id)?,
        summary,
        max_turn: max_turn.max(0) as u64,
        summarized_turn: summarized_turn.max(0) as u64,
        last_accessed: parse_ts(&last_accessed)?,
    })
}

#[derive(Clone)]
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn ensure(&self, session_id: Uuid, user_id: Uuid) -> Result<()> {
        self.db
            .with_conn(|conn| Self::ensure_in(conn, session_id, user_id))
    }

    /// Create the session (and its user) if absent.
    pub fn ensure_in(conn: &Connection, session_id: Uuid, user_id: Uuid) -> Result<()> {
        UserRepo::ensure_in(conn, user_id)?;
        let now = now_string();
        conn.execute(
            "INSERT INTO sessions (id, user_id, last_accessed, created_at) \
             VALUES (?1, ?2, ?3, ?3) ON CONFLICT (id) DO NOTHING",
            params![session_id.to_string(), user_id.to_string(), now],
        )?;
        Ok(())
    }

    pub fn get(&self, session_id: Uuid) -> Result<SessionRow> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, summary, max_turn, summarized_turn, last_accessed \
                 FROM sessions WHERE id = ?1",
                params![session_id.to_string()],
                row_to_session,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))
            .and_then(into_session)
        })
    }

    /// Advance the committed high-water mark after a flush. `max_turn`
    /// never regresses on redelivered batches.
    pub fn record_flush_in(conn: &Connection, session_id: Uuid, max_turn: u64) -> Result<()> {
        conn.execute(
            "UPDATE sessions SET max_turn = MAX(max_turn, ?2), last_accessed = ?3 \
             WHERE id = ?1",
            params![session_id.to_string(), max_turn as i64, now_string()],
        )?;
        Ok(())
    }

    pub fn set_summary(&self, session_id: Uuid, summary: &str, summarized_turn: u64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET summary = ?2, summarized_turn = ?3 WHERE id = ?1",
                params![session_id.to_string(), summary, summarized_turn as i64],
            )?;
            Ok(())
        })
    }

    /// Summaries of the user's other sessions, most recently touched
    /// first. Feeds the prior-session blocks of a rebuilt window.
    pub fn recent_summaries(
        &self,
        user_id: Uuid,
        exclude_session: Uuid,
        limit: usize,
    ) -> Result<Vec<SessionSummary>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, summary, last_accessed FROM sessions \
                 WHERE user_id = ?1 AND id != ?2 AND summary IS NOT NULL \
                 ORDER BY last_accessed DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![user_id.to_string(), exclude_session.to_string(), limit as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )?;
            let mut summaries = Vec::new();
            for row in rows {
                let (id, summary, last_accessed) = row?;
                summaries.push(SessionSummary {
                    session_id: parse_uuid(&id)?,
                    summary,
                    last_accessed: parse_ts(&last_accessed)?,
                });
            }
            Ok(summaries)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Database, SessionRepo) {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        (db, repo)
    }

    #[test]
    fn ensure_creates_user_and_session() {
        let (_db, repo) = setup();
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();

        repo.ensure(session, user).unwrap();
        let row = repo.get(session).unwrap();
        assert_eq!(row.user_id, user);
        assert_eq!(row.max_turn, 0);
        assert!(row.summary.is_none());
    }

    #[test]
    fn flush_high_water_mark_never_regresses() {
        let (db, repo) = setup();
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();
        repo.ensure(session, user).unwrap();

        db.transaction(|conn| SessionRepo::record_flush_in(conn, session, 5)).unwrap();
        db.transaction(|conn| SessionRepo::record_flush_in(conn, session, 3)).unwrap();

        assert_eq!(repo.get(session).unwrap().max_turn, 5);
    }

    #[test]
    fn recent_summaries_excludes_current_and_unsummarized() {
        let (_db, repo) = setup();
        let user = Uuid::new_v4();
        let current = Uuid::new_v4();
        let old_a = Uuid::new_v4();
        let old_b = Uuid::new_v4();

        repo.ensure(current, user).unwrap();
        repo.ensure(old_a, user).unwrap();
        repo.ensure(old_b, user).unwrap();
        repo.set_summary(current, "current summary", 4).unwrap();
        repo.set_summary(old_a, "older discussion of surah 2", 12).unwrap();

        let summaries = repo.recent_summaries(user, current, 5).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].session_id, old_a);
        assert_eq!(summaries[0].summary, "older discussion of surah 2");
    }

    #[test]
    fn summary_records_covered_turn() {
        let (_db, repo) = setup();
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();
        repo.ensure(session, user).unwrap();

        repo.set_summary(session, "talked about tafsir of al-fatiha", 11).unwrap();
        let row = repo.get(session).unwrap();
        assert_eq!(row.summary.as_deref(), Some("talked about tafsir of al-fatiha"));
        assert_eq!(row.summarized_turn, 11);
    }
}
