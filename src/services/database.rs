use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use crate::models::{Case, CaseStatus, CaseSummary, Message, Role};

#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Create an in-memory database (used for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            );",
        )?;

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE cases (
                    id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    title TEXT,
                    sector TEXT,
                    status TEXT NOT NULL DEFAULT 'SUBMITTED',
                    answers TEXT NOT NULL,
                    result TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE messages (
                    id TEXT PRIMARY KEY,
                    case_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    FOREIGN KEY (case_id) REFERENCES cases(id) ON DELETE CASCADE
                );

                CREATE INDEX idx_cases_workspace ON cases(workspace_id, created_at DESC);
                CREATE INDEX idx_messages_case ON messages(case_id, created_at);

                INSERT INTO schema_version (version) VALUES (1);",
            )?;
        }

        Ok(())
    }

    /// Round-trips a trivial query; used by the health probe.
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await?
    }

    // --- Case CRUD ---

    pub async fn insert_case(&self, case: &Case) -> Result<()> {
        let conn = self.conn.clone();
        let case = case.clone();
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO cases (id, workspace_id, user_id, title, sector, status, answers, result, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    case.id,
                    case.workspace_id,
                    case.user_id,
                    case.title,
                    case.sector,
                    case.status.as_str(),
                    serde_json::to_string(&case.answers)?,
                    case.result,
                    timestamp(&case.created_at),
                    timestamp(&case.updated_at),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn list_cases(&self, workspace_id: &str) -> Result<Vec<CaseSummary>> {
        let conn = self.conn.clone();
        let workspace_id = workspace_id.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id, title, sector, status, created_at
                 FROM cases WHERE workspace_id = ?1 ORDER BY created_at DESC",
            )?;
            let cases = stmt
                .query_map(params![workspace_id], |row| Ok(Self::row_to_summary(row)))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(cases)
        })
        .await?
    }

    pub async fn get_case(&self, workspace_id: &str, id: &str) -> Result<Option<Case>> {
        let conn = self.conn.clone();
        let workspace_id = workspace_id.to_string();
        let id = id.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            Self::select_case(&conn, &workspace_id, &id)
        })
        .await?
    }

    /// Replace the questionnaire answers of a case. Returns the updated case,
    /// or `None` when the case does not exist in the workspace.
    pub async fn update_case_answers(
        &self,
        workspace_id: &str,
        id: &str,
        answers: &serde_json::Value,
    ) -> Result<Option<Case>> {
        let conn = self.conn.clone();
        let workspace_id = workspace_id.to_string();
        let id = id.to_string();
        let answers = serde_json::to_string(answers)?;
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let changed = conn.execute(
                "UPDATE cases SET answers = ?1, updated_at = ?2 WHERE id = ?3 AND workspace_id = ?4",
                params![answers, timestamp(&Utc::now()), id, workspace_id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            Self::select_case(&conn, &workspace_id, &id)
        })
        .await?
    }

    // --- Messages ---

    /// Messages are written by the drafting worker, which shares this database.
    #[cfg(test)]
    pub async fn insert_message(&self, case_id: &str, message: &Message) -> Result<()> {
        let conn = self.conn.clone();
        let case_id = case_id.to_string();
        let msg = message.clone();
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO messages (id, case_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    case_id,
                    msg.role.as_str(),
                    msg.content,
                    timestamp(&msg.created_at),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Chat history of a case, oldest first. Cases outside the workspace yield
    /// an empty history rather than an error.
    pub async fn list_messages(&self, workspace_id: &str, case_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.clone();
        let workspace_id = workspace_id.to_string();
        let case_id = case_id.to_string();
        task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT m.role, m.content, m.created_at
                 FROM messages m JOIN cases c ON c.id = m.case_id
                 WHERE m.case_id = ?1 AND c.workspace_id = ?2
                 ORDER BY m.created_at ASC, m.rowid ASC",
            )?;
            let messages = stmt
                .query_map(params![case_id, workspace_id], |row| {
                    Ok(Self::row_to_message(row))
                })?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await?
    }

    // --- Row helpers ---

    fn select_case(conn: &Connection, workspace_id: &str, id: &str) -> Result<Option<Case>> {
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, user_id, title, sector, status, answers, result, created_at, updated_at
             FROM cases WHERE id = ?1 AND workspace_id = ?2",
        )?;
        let result = stmt
            .query_row(params![id, workspace_id], |row| Ok(Self::row_to_case(row)))
            .optional()?;
        match result {
            Some(Ok(case)) => Ok(Some(case)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn row_to_case(row: &rusqlite::Row) -> Result<Case> {
        let status_str: String = row.get(5)?;
        let answers_str: String = row.get(6)?;
        let created_str: String = row.get(8)?;
        let updated_str: String = row.get(9)?;

        Ok(Case {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            user_id: row.get(2)?,
            title: row.get(3)?,
            sector: row.get(4)?,
            status: CaseStatus::from_str(&status_str)
                .ok_or_else(|| anyhow::anyhow!("Unknown case status: {}", status_str))?,
            answers: serde_json::from_str(&answers_str)?,
            result: row.get(7)?,
            created_at: DateTime::parse_from_rfc3339(&created_str)?.with_timezone(&Utc),
            updated_at: DateTime::parse_from_rfc3339(&updated_str)?.with_timezone(&Utc),
        })
    }

    fn row_to_summary(row: &rusqlite::Row) -> Result<CaseSummary> {
        let status_str: String = row.get(3)?;
        let created_str: String = row.get(4)?;

        Ok(CaseSummary {
            id: row.get(0)?,
            title: row.get(1)?,
            sector: row.get(2)?,
            status: CaseStatus::from_str(&status_str)
                .ok_or_else(|| anyhow::anyhow!("Unknown case status: {}", status_str))?,
            created_at: DateTime::parse_from_rfc3339(&created_str)?.with_timezone(&Utc),
        })
    }

    fn row_to_message(row: &rusqlite::Row) -> Result<Message> {
        let role_str: String = row.get(0)?;
        let created_str: String = row.get(2)?;

        Ok(Message {
            role: Role::from_str(&role_str)
                .ok_or_else(|| anyhow::anyhow!("Unknown role: {}", role_str))?,
            content: row.get(1)?,
            created_at: DateTime::parse_from_rfc3339(&created_str)?.with_timezone(&Utc),
        })
    }
}

// Fixed-width so that lexical order in SQLite matches chronological order.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
