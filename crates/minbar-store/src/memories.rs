use rusqlite::params;
use uuid::Uuid;

use minbar_core::window::Memory;

use crate::database::{now_string, parse_ts, Database};
use crate::error::Result;

/// Durable user facts keyed by stable kebab-case keys. Upserts replace
/// content in place so a fact never appears twice.
#[derive(Clone)]
pub struct MemoryRepo {
    db: Database,
}

impl MemoryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn upsert(&self, user_id: Uuid, key: &str, content: &str, confidence: f64) -> Result<()> {
        self.db.with_conn(|conn| {
            let now = now_string();
            conn.execute(
                "INSERT INTO memories (user_id, key, content, confidence, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
                 ON CONFLICT (user_id, key) DO UPDATE SET \
                 content = excluded.content, confidence = excluded.confidence, \
                 updated_at = excluded.updated_at",
                params![user_id.to_string(), key, content, confidence, now],
            )?;
            Ok(())
        })
    }

    pub fn delete(&self, user_id: Uuid, key: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM memories WHERE user_id = ?1 AND key = ?2",
                params![user_id.to_string(), key],
            )?;
            Ok(())
        })
    }

    /// Most recently updated facts first, capped at `limit`.
    pub fn list_for_user(&self, user_id: Uuid, limit: usize) -> Result<Vec<Memory>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, content, updated_at FROM memories \
                 WHERE user_id = ?1 ORDER BY updated_at DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![user_id.to_string(), limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            let mut memories = Vec::new();
            for row in rows {
                let (key, content, updated_at) = row?;
                memories.push(Memory {
                    key,
                    content,
                    updated_at: parse_ts(&updated_at)?,
                });
            }
            Ok(memories)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserRepo;

    fn setup() -> (MemoryRepo, Uuid) {
        let db = Database::in_memory().unwrap();
        let user = Uuid::new_v4();
        UserRepo::new(db.clone()).ensure(user).unwrap();
        (MemoryRepo::new(db), user)
    }

    #[test]
    fn upsert_replaces_in_place() {
        let (repo, user) = setup();
        repo.upsert(user, "preferred-reciter", "Prefers Al-Husary", 0.9).unwrap();
        repo.upsert(user, "preferred-reciter", "Prefers Al-Minshawi", 0.95).unwrap();

        let memories = repo.list_for_user(user, 50).unwrap();
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].content, "Prefers Al-Minshawi");
    }

    #[test]
    fn delete_removes_only_the_key() {
        let (repo, user) = setup();
        repo.upsert(user, "studies-tafsir", "Working through Ibn Kathir", 0.8).unwrap();
        repo.upsert(user, "native-language", "Speaks Urdu", 0.9).unwrap();

        repo.delete(user, "studies-tafsir").unwrap();
        let memories = repo.list_for_user(user, 50).unwrap();
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].key, "native-language");
    }

    #[test]
    fn list_respects_limit() {
        let (repo, user) = setup();
        for i in 0..5 {
            repo.upsert(user, &format!("fact-{i}"), "content", 1.0).unwrap();
        }
        assert_eq!(repo.list_for_user(user, 3).unwrap().len(), 3);
    }

    #[test]
    fn users_are_isolated() {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        let repo = MemoryRepo::new(db);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        users.ensure(a).unwrap();
        users.ensure(b).unwrap();

        repo.upsert(a, "shared-key", "belongs to a", 1.0).unwrap();
        assert!(repo.list_for_user(b, 50).unwrap().is_empty());
    }
}
