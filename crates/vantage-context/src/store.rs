// Context Store
// Append-only versioned storage with a full audit trail.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::Level;

use vantage_observability::{emit_event, Component, ObservabilityEvent};
use vantage_types::{
    AuditAction, ContextAuditEvent, ContextEntry, ContextMetadata, ContextPatch, ContextQuery,
    Domain, NewContextEntry,
};

use crate::types::{ContextError, ContextResult};

/// Versioned, audited store for context shared between agents.
///
/// Every write appends a new row; nothing is ever overwritten or physically
/// removed. Version assignment is serialized by the connection lock.
pub struct ContextStore {
    conn: Arc<Mutex<Connection>>,
}

// Raw row as it comes out of sqlite, converted to ContextEntry outside the
// query_map closure so parse failures surface as ContextError.
type EntryRow = (
    String,         // entry_id
    i64,            // version
    String,         // workspace_id
    String,         // domain
    String,         // entry_type
    String,         // content json
    String,         // created_at
    String,         // created_by
    Option<i64>,    // parent_version
    String,         // tags json
    Option<f64>,    // relevance_score
    String,         // signature
);

const ENTRY_COLUMNS: &str = "entry_id, version, workspace_id, domain, entry_type, content, \
     created_at, created_by, parent_version, tags, relevance_score, signature";

impl ContextStore {
    /// Open (or create) the store at `db_path`.
    pub async fn new(db_path: &Path) -> ContextResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;

        // PRAGMA journal_mode returns a row, so query_row and ignore it
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        tracing::debug!(path = %db_path.display(), "context store opened");
        Ok(store)
    }

    /// In-memory store, used by the scheduler default and in tests.
    pub async fn in_memory() -> ContextResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> ContextResult<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS context_entries (
                entry_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                workspace_id TEXT NOT NULL,
                domain TEXT NOT NULL,
                entry_type TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                created_by TEXT NOT NULL,
                parent_version INTEGER,
                tags TEXT NOT NULL,
                relevance_score REAL,
                signature TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (entry_id, version)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_context_entries_workspace
             ON context_entries(workspace_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_context_entries_type
             ON context_entries(entry_type)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS context_audit (
                id TEXT PRIMARY KEY,
                entry_id TEXT NOT NULL,
                action TEXT NOT NULL,
                actor TEXT NOT NULL,
                at TEXT NOT NULL,
                detail TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_context_audit_entry
             ON context_audit(entry_id)",
            [],
        )?;

        Ok(())
    }

    /// Store a brand new entry as version 1.
    pub async fn store(&self, new: NewContextEntry, user_id: &str) -> ContextResult<ContextEntry> {
        let entry = ContextEntry {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: new.workspace_id,
            domain: new.domain,
            entry_type: new.entry_type,
            signature: content_signature(&new.content),
            content: new.content,
            metadata: ContextMetadata {
                created_at: Utc::now(),
                created_by: user_id.to_string(),
                version: 1,
                parent_version: None,
                tags: new.tags,
                relevance_score: new.relevance_score,
            },
        };

        let conn = self.conn.lock().await;
        insert_version(&conn, &entry)?;
        append_audit(&conn, &entry.id, AuditAction::Create, user_id, None)?;
        drop(conn);

        emit_event(
            Level::INFO,
            Component::Context,
            ObservabilityEvent {
                event: "context.stored",
                mission_id: None,
                workspace_id: Some(&entry.workspace_id),
                provider_id: None,
                model_id: None,
                status: None,
                error_code: None,
                detail: Some(&entry.id),
            },
        );
        Ok(entry)
    }

    /// Latest non-deleted version. Reads are audited, including misses.
    pub async fn get(&self, id: &str, user_id: &str) -> ContextResult<Option<ContextEntry>> {
        let conn = self.conn.lock().await;
        let entry = latest_version(&conn, id)?;
        let detail = if entry.is_some() { None } else { Some("miss") };
        append_audit(&conn, id, AuditAction::Read, user_id, detail)?;
        Ok(entry)
    }

    /// Latest versions matching the query, excluding soft-deleted entries.
    pub async fn query(
        &self,
        query: &ContextQuery,
        user_id: &str,
    ) -> ContextResult<Vec<ContextEntry>> {
        let conn = self.conn.lock().await;

        let mut sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM context_entries e
             JOIN (SELECT entry_id AS eid, MAX(version) AS head
                   FROM context_entries GROUP BY entry_id) heads
               ON e.entry_id = heads.eid AND e.version = heads.head
             WHERE e.deleted = 0"
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ws) = &query.workspace_id {
            sql.push_str(" AND e.workspace_id = ?");
            args.push(Box::new(ws.clone()));
        }
        if let Some(domain) = query.domain {
            sql.push_str(" AND e.domain = ?");
            args.push(Box::new(domain.to_string()));
        }
        if let Some(entry_type) = &query.entry_type {
            sql.push_str(" AND e.entry_type = ?");
            args.push(Box::new(entry_type.clone()));
        }
        if let Some(after) = query.created_after {
            sql.push_str(" AND e.created_at > ?");
            args.push(Box::new(after.to_rfc3339()));
        }
        if let Some(before) = query.created_before {
            sql.push_str(" AND e.created_at < ?");
            args.push(Box::new(before.to_rfc3339()));
        }
        if query.by_relevance {
            sql.push_str(" ORDER BY e.relevance_score IS NULL, e.relevance_score DESC");
        } else {
            sql.push_str(" ORDER BY e.created_at DESC");
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), entry_row)?;
        let mut entries = Vec::new();
        for row in rows {
            let entry = entry_from_row(row?)?;
            // Tag filtering happens here; tags live as a JSON array column.
            if !query.tags.is_empty()
                && !query.tags.iter().all(|t| entry.metadata.tags.contains(t))
            {
                continue;
            }
            entries.push(entry);
            if let Some(limit) = query.limit {
                if entries.len() >= limit {
                    break;
                }
            }
        }
        drop(stmt);

        for entry in &entries {
            append_audit(&conn, &entry.id, AuditAction::Read, user_id, Some("query"))?;
        }
        Ok(entries)
    }

    /// Append a new version carrying the patch. Returns None for unknown or
    /// deleted entries.
    pub async fn update(
        &self,
        id: &str,
        patch: ContextPatch,
        user_id: &str,
        reason: Option<&str>,
    ) -> ContextResult<Option<ContextEntry>> {
        let conn = self.conn.lock().await;
        let Some(current) = latest_version(&conn, id)? else {
            append_audit(&conn, id, AuditAction::Update, user_id, Some("miss"))?;
            return Ok(None);
        };

        let content = patch.content.unwrap_or_else(|| current.content.clone());
        let next = ContextEntry {
            id: current.id.clone(),
            workspace_id: current.workspace_id.clone(),
            domain: current.domain,
            entry_type: current.entry_type.clone(),
            signature: content_signature(&content),
            content,
            metadata: ContextMetadata {
                created_at: Utc::now(),
                created_by: user_id.to_string(),
                version: current.metadata.version + 1,
                parent_version: Some(current.metadata.version),
                tags: patch.tags.unwrap_or_else(|| current.metadata.tags.clone()),
                relevance_score: patch.relevance_score.or(current.metadata.relevance_score),
            },
        };
        insert_version(&conn, &next)?;
        append_audit(&conn, id, AuditAction::Update, user_id, reason)?;
        Ok(Some(next))
    }

    /// Copy the current version of `id` into a fresh entry. Both sides of the
    /// fork get an audit record naming the other.
    pub async fn fork(
        &self,
        id: &str,
        user_id: &str,
        reason: Option<&str>,
    ) -> ContextResult<Option<ContextEntry>> {
        let conn = self.conn.lock().await;
        let Some(source) = latest_version(&conn, id)? else {
            append_audit(&conn, id, AuditAction::Fork, user_id, Some("miss"))?;
            return Ok(None);
        };

        let forked = ContextEntry {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: source.workspace_id.clone(),
            domain: source.domain,
            entry_type: source.entry_type.clone(),
            content: source.content.clone(),
            signature: source.signature.clone(),
            metadata: ContextMetadata {
                created_at: Utc::now(),
                created_by: user_id.to_string(),
                version: 1,
                parent_version: None,
                tags: source.metadata.tags.clone(),
                relevance_score: source.metadata.relevance_score,
            },
        };
        insert_version(&conn, &forked)?;

        let source_detail = format!("forked_to={}", forked.id);
        let fork_detail = format!(
            "forked_from={} version={} reason={}",
            source.id,
            source.metadata.version,
            reason.unwrap_or("")
        );
        append_audit(&conn, id, AuditAction::Fork, user_id, Some(&source_detail))?;
        append_audit(
            &conn,
            &forked.id,
            AuditAction::Fork,
            user_id,
            Some(&fork_detail),
        )?;
        Ok(Some(forked))
    }

    /// Soft delete. Versions and the audit trail survive.
    pub async fn delete(&self, id: &str, user_id: &str) -> ContextResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE context_entries SET deleted = 1 WHERE entry_id = ?1",
            params![id],
        )?;
        let detail = if changed == 0 { Some("miss") } else { None };
        append_audit(&conn, id, AuditAction::Delete, user_id, detail)?;
        drop(conn);

        if changed > 0 {
            emit_event(
                Level::INFO,
                Component::Context,
                ObservabilityEvent {
                    event: "context.deleted",
                    mission_id: None,
                    workspace_id: None,
                    provider_id: None,
                    model_id: None,
                    status: None,
                    error_code: None,
                    detail: Some(id),
                },
            );
        }
        Ok(changed > 0)
    }

    /// All versions of an entry, ascending, soft-deleted included.
    pub async fn get_version_history(&self, id: &str) -> ContextResult<Vec<ContextEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM context_entries
             WHERE entry_id = ?1 ORDER BY version ASC"
        ))?;
        let rows = stmt.query_map(params![id], entry_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(entry_from_row(row?)?);
        }
        Ok(entries)
    }

    /// Promote a historical version's content to a new head version. Fails
    /// with `NotFound` when the entry or the requested version is unknown;
    /// the miss is still audited.
    pub async fn restore_version(
        &self,
        id: &str,
        version: u64,
        user_id: &str,
    ) -> ContextResult<ContextEntry> {
        let conn = self.conn.lock().await;
        let Some(head) = latest_version(&conn, id)? else {
            append_audit(&conn, id, AuditAction::Restore, user_id, Some("miss"))?;
            return Err(ContextError::NotFound(format!("entry {id}")));
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM context_entries
             WHERE entry_id = ?1 AND version = ?2"
        ))?;
        let row = stmt
            .query_row(params![id, version as i64], entry_row)
            .optional()?;
        drop(stmt);
        let Some(row) = row else {
            append_audit(&conn, id, AuditAction::Restore, user_id, Some("miss"))?;
            return Err(ContextError::NotFound(format!(
                "entry {id} version {version}"
            )));
        };
        let historical = entry_from_row(row)?;

        let restored = ContextEntry {
            id: head.id.clone(),
            workspace_id: head.workspace_id.clone(),
            domain: head.domain,
            entry_type: head.entry_type.clone(),
            content: historical.content.clone(),
            signature: historical.signature.clone(),
            metadata: ContextMetadata {
                created_at: Utc::now(),
                created_by: user_id.to_string(),
                version: head.metadata.version + 1,
                parent_version: Some(head.metadata.version),
                tags: historical.metadata.tags.clone(),
                relevance_score: historical.metadata.relevance_score,
            },
        };
        insert_version(&conn, &restored)?;
        let detail = format!("restored_from_version={version}");
        append_audit(&conn, id, AuditAction::Restore, user_id, Some(&detail))?;
        Ok(restored)
    }

    /// Full audit trail for an entry, oldest first.
    pub async fn get_audit_trail(&self, id: &str) -> ContextResult<Vec<ContextAuditEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, entry_id, action, actor, at, detail FROM context_audit
             WHERE entry_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (id, entry_id, action, actor, at, detail) = row?;
            events.push(ContextAuditEvent {
                id,
                entry_id,
                action: parse_enum(&action)?,
                actor,
                at: parse_timestamp(&at)?,
                detail,
            });
        }
        Ok(events)
    }
}

fn content_signature(content: &Value) -> String {
    let canonical = content.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:064x}", hasher.finalize())
}

fn insert_version(conn: &Connection, entry: &ContextEntry) -> ContextResult<()> {
    conn.execute(
        "INSERT INTO context_entries (entry_id, version, workspace_id, domain, entry_type,
            content, created_at, created_by, parent_version, tags, relevance_score,
            signature, deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0)",
        params![
            entry.id,
            entry.metadata.version as i64,
            entry.workspace_id,
            entry.domain.to_string(),
            entry.entry_type,
            entry.content.to_string(),
            entry.metadata.created_at.to_rfc3339(),
            entry.metadata.created_by,
            entry.metadata.parent_version.map(|v| v as i64),
            serde_json::to_string(&entry.metadata.tags)?,
            entry.metadata.relevance_score,
            entry.signature,
        ],
    )?;
    Ok(())
}

fn append_audit(
    conn: &Connection,
    entry_id: &str,
    action: AuditAction,
    actor: &str,
    detail: Option<&str>,
) -> ContextResult<()> {
    conn.execute(
        "INSERT INTO context_audit (id, entry_id, action, actor, at, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            uuid::Uuid::new_v4().to_string(),
            entry_id,
            action.to_string(),
            actor,
            Utc::now().to_rfc3339(),
            detail,
        ],
    )?;
    Ok(())
}

fn latest_version(conn: &Connection, id: &str) -> ContextResult<Option<ContextEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM context_entries
         WHERE entry_id = ?1 AND deleted = 0
         ORDER BY version DESC LIMIT 1"
    ))?;
    let row = stmt.query_row(params![id], entry_row).optional()?;
    match row {
        Some(row) => Ok(Some(entry_from_row(row)?)),
        None => Ok(None),
    }
}

fn entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn entry_from_row(row: EntryRow) -> ContextResult<ContextEntry> {
    let (
        entry_id,
        version,
        workspace_id,
        domain,
        entry_type,
        content,
        created_at,
        created_by,
        parent_version,
        tags,
        relevance_score,
        signature,
    ) = row;
    Ok(ContextEntry {
        id: entry_id,
        workspace_id,
        domain: parse_enum::<Domain>(&domain)?,
        entry_type,
        content: serde_json::from_str(&content)?,
        metadata: ContextMetadata {
            created_at: parse_timestamp(&created_at)?,
            created_by,
            version: version as u64,
            parent_version: parent_version.map(|v| v as u64),
            tags: serde_json::from_str(&tags)?,
            relevance_score,
        },
        signature,
    })
}

fn parse_enum<T: serde::de::DeserializeOwned>(s: &str) -> ContextResult<T> {
    Ok(serde_json::from_value(Value::String(s.to_string()))?)
}

fn parse_timestamp(s: &str) -> ContextResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
