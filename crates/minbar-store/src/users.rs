use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::database::{now_string, parse_ts, parse_uuid, Database};
use crate::error::{Result, StoreError};

/// Per-user message counters driving the Memorizer.
#[derive(Clone, Debug, PartialEq)]
pub struct UserRow {
    pub id: Uuid,
    pub total_messages: u64,
    pub total_messages_memorized: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn ensure(&self, user_id: Uuid) -> Result<()> {
        self.db.with_conn(|conn| Self::ensure_in(conn, user_id))
    }

    /// Create the user row if absent. Callable from inside a flush
    /// transaction.
    pub fn ensure_in(conn: &Connection, user_id: Uuid) -> Result<()> {
        let now = now_string();
        conn.execute(
            "INSERT INTO users (id, created_at, updated_at) VALUES (?1, ?2, ?2) \
             ON CONFLICT (id) DO NOTHING",
            params![user_id.to_string(), now],
        )?;
        Ok(())
    }

    pub fn get(&self, user_id: Uuid) -> Result<UserRow> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, total_messages, total_messages_memorized, updated_at \
                 FROM users WHERE id = ?1",
                params![user_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))
            .and_then(|(id, total, memorized, updated)| {
                Ok(UserRow {
                    id: parse_uuid(&id)?,
                    total_messages: total.max(0) as u64,
                    total_messages_memorized: memorized.max(0) as u64,
                    updated_at: parse_ts(&updated)?,
                })
            })
        })
    }

    /// Bump the lifetime message counter. Called by the Syncer inside the
    /// flush transaction, once per user with the batch's row count.
    pub fn add_messages_in(conn: &Connection, user_id: Uuid, delta: u64) -> Result<()> {
        conn.execute(
            "UPDATE users SET total_messages = total_messages + ?2, updated_at = ?3 \
             WHERE id = ?1",
            params![user_id.to_string(), delta as i64, now_string()],
        )?;
        Ok(())
    }

    /// Record how far memory extraction has caught up.
    pub fn set_memorized(&self, user_id: Uuid, total_messages_memorized: u64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET total_messages_memorized = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    user_id.to_string(),
                    total_messages_memorized as i64,
                    now_string()
                ],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_then_get() {
        let db = Database::in_memory().unwrap();
        let repo = UserRepo::new(db);
        let user = Uuid::new_v4();

        repo.ensure(user).unwrap();
        repo.ensure(user).unwrap();

        let row = repo.get(user).unwrap();
        assert_eq!(row.id, user);
        assert_eq!(row.total_messages, 0);
        assert_eq!(row.total_messages_memorized, 0);
    }

    #[test]
    fn missing_user_is_not_found() {
        let db = Database::in_memory().unwrap();
        let repo = UserRepo::new(db);
        assert!(matches!(
            repo.get(Uuid::new_v4()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn counters_advance_independently() {
        let db = Database::in_memory().unwrap();
        let repo = UserRepo::new(db.clone());
        let user = Uuid::new_v4();
        repo.ensure(user).unwrap();

        db.transaction(|conn| UserRepo::add_messages_in(conn, user, 3)).unwrap();
        db.transaction(|conn| UserRepo::add_messages_in(conn, user, 4)).unwrap();
        repo.set_memorized(user, 3).unwrap();

        let row = repo.get(user).unwrap();
        assert_eq!(row.total_messages, 7);
        assert_eq!(row.total_messages_memorized, 3);
    }
}
