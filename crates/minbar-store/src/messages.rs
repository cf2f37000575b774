use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use minbar_core::window::{Interaction, Role};

use crate::database::{parse_ts, Database};
use crate::error::{Result, StoreError};

/// One persisted message row. A plain turn stores two rows (user, model);
/// a tool-augmented turn adds a function row between them.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageRow {
    pub session_id: Uuid,
    pub turn: u64,
    pub role: Role,
    pub content: Option<String>,
    pub function_name: Option<String>,
    pub function_call: Option<serde_json::Value>,
    pub function_response: Option<serde_json::Value>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist one Interaction as its message rows, inside the caller's
    /// flush transaction. Keyed `(session, turn, role)`; redelivered
    /// payloads insert nothing. Returns the number of rows written.
    pub fn insert_interaction_in(
        conn: &Connection,
        user_id: Uuid,
        session_id: Uuid,
        interaction: &Interaction,
    ) -> Result<u64> {
        let (Some(prompt), Some(answer)) = (interaction.prompt(), interaction.answer()) else {
            return Err(StoreError::Corrupt("interaction has no inferences".into()));
        };
        let session = session_id.to_string();
        let user = user_id.to_string();
        let created_at = interaction.created_at.to_rfc3339();
        let turn = interaction.turn as i64;
        let mut written = 0u64;

        written += conn.execute(
            "INSERT INTO messages (session_id, user_id, turn, role, content, created_at) \
             VALUES (?1, ?2, ?3, 'user', ?4, ?5) \
             ON CONFLICT (session_id, turn, role) DO NOTHING",
            params![session, user, turn, prompt, created_at],
        )? as u64;

        if interaction.is_tool_augmented() {
            let (name, call, response) = tool_columns(interaction)?;
            written += conn.execute(
                "INSERT INTO messages (session_id, user_id, turn, role, function_name, \
                 function_call, function_response, created_at) \
                 VALUES (?1, ?2, ?3, 'function', ?4, ?5, ?6, ?7) \
                 ON CONFLICT (session_id, turn, role) DO NOTHING",
                params![session, user, turn, name, call, response, created_at],
            )? as u64;
        }

        let (input_tokens, output_tokens) = interaction.inferences.iter().fold((0u32, 0u32), |acc, inf| {
            (
                acc.0 + inf.usage.prompt_tokens,
                acc.1 + inf.usage.completion_tokens,
            )
        });
        written += conn.execute(
            "INSERT INTO messages (session_id, user_id, turn, role, content, input_tokens, \
             output_tokens, created_at) \
             VALUES (?1, ?2, ?3, 'model', ?4, ?5, ?6, ?7) \
             ON CONFLICT (session_id, turn, role) DO NOTHING",
            params![
                session,
                user,
                turn,
                answer,
                input_tokens,
                output_tokens,
                created_at
            ],
        )? as u64;

        Ok(written)
    }

    /// All rows for a session in replay order: by turn, then user before
    /// function before model within a turn.
    pub fn list_by_session(&self, session_id: Uuid) -> Result<Vec<MessageRow>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, turn, role, content, function_name, function_call, \
                 function_response, input_tokens, output_tokens, created_at \
                 FROM messages WHERE session_id = ?1 \
                 ORDER BY turn ASC, \
                 CASE role WHEN 'user' THEN 0 WHEN 'function' THEN 1 ELSE 2 END ASC",
            )?;
            let rows = stmt.query_map(params![session_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, String>(9)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                out.push(into_message_row(row?)?);
            }
            Ok(out)
        })
    }

    /// The user's most recent prompts across all sessions, oldest first,
    /// capped at `limit`. Input for memory extraction.
    pub fn recent_user_texts(&self, user_id: Uuid, limit: usize) -> Result<Vec<String>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT content FROM messages \
                 WHERE user_id = ?1 AND role = 'user' AND content IS NOT NULL \
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![user_id.to_string(), limit as i64], |row| {
                row.get::<_, String>(0)
            })?;
            let mut texts: Vec<String> = rows.collect::<rusqlite::Result<_>>()?;
            texts.reverse();
            Ok(texts)
        })
    }
}

fn tool_columns(interaction: &Interaction) -> Result<(String, String, String)> {
    use minbar_core::window::{InferenceInput, InferenceOutput};

    let call = match &interaction.inferences[0].output {
        InferenceOutput::FunctionCall { call } => call,
        InferenceOutput::Text { .. } => {
            return Err(StoreError::Corrupt(
                "tool-augmented interaction without a function call".into(),
            ))
        }
    };
    let response = match &interaction.inferences[1].input {
        InferenceInput::FunctionResponse { response } => response,
        InferenceInput::Text { .. } => {
            return Err(StoreError::Corrupt(
                "tool-augmented interaction without a function response".into(),
            ))
        }
    };
    Ok((
        call.name.clone(),
        serde_json::to_string(call)?,
        serde_json::to_string(response)?,
    ))
}

type RawMessage = (
    String,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
    i64,
    String,
);

fn into_message_row(raw: RawMessage) -> Result<MessageRow> {
    let (session_id, turn, role, content, function_name, call, response, input, output, created) =
        raw;
    let role: Role = role
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("message role {role:?}")))?;
    let function_call = call.as_deref().map(serde_json::from_str).transpose()?;
    let function_response = response.as_deref().map(serde_json::from_str).transpose()?;
    Ok(MessageRow {
        session_id: crate::database::parse_uuid(&session_id)?,
        turn: turn.max(0) as u64,
        role,
        content,
        function_name,
        function_call,
        function_response,
        input_tokens: input.max(0) as u32,
        output_tokens: output.max(0) as u32,
        created_at: parse_ts(&created)?,
    })
}
