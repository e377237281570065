//! Durable store on SQLite.
//!
//! Schema changes ship as numbered migrations, applied in ascending order
//! on open and recorded in `schema_migrations`. Batches from
//! [`Store::apply`] run in a `BEGIN IMMEDIATE` transaction where each
//! mutation is one guarded `UPDATE`/`DELETE`; a required statement that
//! touches zero rows rolls the transaction back.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::info;
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::registry::{Agent, AgentStatus};
use crate::scheduler::{Job, JobKind, JobStatus, KeyspaceRange, TerminalReason};
use crate::store::{
    AgentGuard, AgentPatch, AgentRepository, HashFile, HashFileRepository, JobGuard, JobPatch,
    JobRepository, Mutation, Store, Wordlist, WordlistRepository,
};

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
CREATE TABLE agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    address TEXT NOT NULL,
    port INTEGER NOT NULL,
    capabilities TEXT NOT NULL,
    throughput REAL,
    status TEXT NOT NULL,
    current_job TEXT,
    registration_key TEXT NOT NULL UNIQUE,
    last_heartbeat INTEGER NOT NULL,
    registered_at INTEGER NOT NULL,
    UNIQUE (name, address, port)
);

CREATE TABLE hash_files (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    hash_type INTEGER,
    hash_count INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE wordlists (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    word_count INTEGER,
    size_bytes INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE jobs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    hash_type INTEGER NOT NULL,
    attack_mode INTEGER NOT NULL,
    hash_file_id TEXT NOT NULL,
    wordlist_id TEXT NOT NULL,
    rules TEXT,
    assigned_agent TEXT,
    progress REAL NOT NULL DEFAULT 0,
    speed REAL NOT NULL DEFAULT 0,
    eta INTEGER,
    result TEXT,
    total_words INTEGER NOT NULL DEFAULT 0,
    processed_words INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER
);

CREATE INDEX idx_jobs_status ON jobs(status, created_at);
"#,
    ),
    (
        2,
        r#"
ALTER TABLE jobs ADD COLUMN kind TEXT NOT NULL DEFAULT 'single';
ALTER TABLE jobs ADD COLUMN parent_id TEXT;
ALTER TABLE jobs ADD COLUMN keyspace_start INTEGER;
ALTER TABLE jobs ADD COLUMN keyspace_end INTEGER;
ALTER TABLE jobs ADD COLUMN preferred_agent TEXT;
ALTER TABLE jobs ADD COLUMN affinity TEXT;

CREATE INDEX idx_jobs_parent ON jobs(parent_id);
"#,
    ),
    (
        3,
        r#"
ALTER TABLE jobs ADD COLUMN reason TEXT;
ALTER TABLE jobs ADD COLUMN error TEXT;
ALTER TABLE jobs ADD COLUMN requeues INTEGER NOT NULL DEFAULT 0;

CREATE INDEX idx_wordlists_name ON wordlists(name);
"#,
    ),
    (
        4,
        r#"
DROP INDEX idx_wordlists_name;
CREATE UNIQUE INDEX idx_wordlists_name ON wordlists(name);
"#,
    ),
];

const AGENT_COLUMNS: &str = "id, name, address, port, capabilities, throughput, status, \
     current_job, registration_key, last_heartbeat, registered_at";

const JOB_COLUMNS: &str = "id, name, status, kind, hash_type, attack_mode, hash_file_id, \
     wordlist_id, rules, preferred_agent, affinity, assigned_agent, parent_id, keyspace_start, \
     keyspace_end, progress, speed, eta, result, reason, error, total_words, processed_words, \
     requeues, created_at, started_at, completed_at";

const FIFO_ORDER: &str = "ORDER BY created_at ASC, COALESCE(keyspace_start, 0) ASC, id ASC";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| FleetError::Storage(format!("{}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "SQLite store opened");
        Ok(store)
    }

    /// In-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Versions recorded in `schema_migrations`, ascending.
    pub fn applied_migrations(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
        let versions = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(versions)
    }
}

fn migrate(conn: &mut Connection) -> Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
    )?;

    let applied: HashSet<i64> = {
        let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
        let versions = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<HashSet<i64>, _>>()?;
        versions
    };

    let mut count = 0;
    for (version, sql) in MIGRATIONS {
        if applied.contains(version) {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, Utc::now().timestamp_millis()],
        )?;
        tx.commit()?;
        info!(version, "Applied schema migration");
        count += 1;
    }
    Ok(count)
}

// ============================================================================
// ROW CONVERSION
// ============================================================================

fn ts(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn conversion_error(column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("invalid {}: {}", column, value).into(),
    )
}

fn get_time(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(column)?;
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| conversion_error(column, &ms.to_string()))
}

fn get_opt_time(row: &Row, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(column)? {
        Some(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .map(Some)
            .ok_or_else(|| conversion_error(column, &ms.to_string())),
        None => Ok(None),
    }
}

fn get_uuid(row: &Row, column: &str) -> rusqlite::Result<Uuid> {
    let text: String = row.get(column)?;
    Uuid::parse_str(&text).map_err(|_| conversion_error(column, &text))
}

fn get_opt_uuid(row: &Row, column: &str) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(column)? {
        Some(text) => Uuid::parse_str(&text)
            .map(Some)
            .map_err(|_| conversion_error(column, &text)),
        None => Ok(None),
    }
}

fn get_u64(row: &Row, column: &str) -> rusqlite::Result<u64> {
    Ok(row.get::<_, i64>(column)?.max(0) as u64)
}

fn agent_from_row(row: &Row) -> rusqlite::Result<Agent> {
    let status: String = row.get("status")?;
    Ok(Agent {
        id: get_uuid(row, "id")?,
        name: row.get("name")?,
        address: row.get("address")?,
        port: row.get("port")?,
        capabilities: row.get("capabilities")?,
        throughput: row.get("throughput")?,
        status: AgentStatus::parse(&status).ok_or_else(|| conversion_error("status", &status))?,
        current_job: get_opt_uuid(row, "current_job")?,
        registration_key: row.get("registration_key")?,
        last_heartbeat: get_time(row, "last_heartbeat")?,
        registered_at: get_time(row, "registered_at")?,
    })
}

fn job_from_row(row: &Row) -> rusqlite::Result<Job> {
    let status: String = row.get("status")?;
    let kind: String = row.get("kind")?;
    let reason: Option<String> = row.get("reason")?;
    let keyspace = match (
        row.get::<_, Option<i64>>("keyspace_start")?,
        row.get::<_, Option<i64>>("keyspace_end")?,
    ) {
        (Some(start), Some(end)) => Some(KeyspaceRange::new(start as u64, end as u64)),
        _ => None,
    };

    Ok(Job {
        id: get_uuid(row, "id")?,
        name: row.get("name")?,
        status: JobStatus::parse(&status).ok_or_else(|| conversion_error("status", &status))?,
        kind: JobKind::parse(&kind).ok_or_else(|| conversion_error("kind", &kind))?,
        hash_type: row.get("hash_type")?,
        attack_mode: row.get("attack_mode")?,
        hash_file_id: get_uuid(row, "hash_file_id")?,
        wordlist_id: get_uuid(row, "wordlist_id")?,
        rules: row.get("rules")?,
        preferred_agent: get_opt_uuid(row, "preferred_agent")?,
        affinity: get_opt_uuid(row, "affinity")?,
        assigned_agent: get_opt_uuid(row, "assigned_agent")?,
        parent_id: get_opt_uuid(row, "parent_id")?,
        keyspace,
        progress: row.get("progress")?,
        speed: row.get("speed")?,
        eta: get_opt_time(row, "eta")?,
        result: row.get("result")?,
        reason: match reason {
            Some(r) => Some(TerminalReason::parse(&r).ok_or_else(|| conversion_error("reason", &r))?),
            None => None,
        },
        error: row.get("error")?,
        total_words: get_u64(row, "total_words")?,
        processed_words: get_u64(row, "processed_words")?,
        requeues: row.get("requeues")?,
        created_at: get_time(row, "created_at")?,
        started_at: get_opt_time(row, "started_at")?,
        completed_at: get_opt_time(row, "completed_at")?,
    })
}

fn hash_file_from_row(row: &Row) -> rusqlite::Result<HashFile> {
    Ok(HashFile {
        id: get_uuid(row, "id")?,
        name: row.get("name")?,
        hash_type: row.get("hash_type")?,
        hash_count: get_u64(row, "hash_count")?,
        created_at: get_time(row, "created_at")?,
    })
}

fn wordlist_from_row(row: &Row) -> rusqlite::Result<Wordlist> {
    Ok(Wordlist {
        id: get_uuid(row, "id")?,
        name: row.get("name")?,
        word_count: row.get::<_, Option<i64>>("word_count")?.map(|n| n.max(0) as u64),
        size_bytes: get_u64(row, "size_bytes")?,
        created_at: get_time(row, "created_at")?,
    })
}

fn opt_uuid_value(id: Option<Uuid>) -> Value {
    id.map_or(Value::Null, |id| Value::Text(id.to_string()))
}

fn opt_time_value(at: Option<DateTime<Utc>>) -> Value {
    at.map_or(Value::Null, |at| Value::Integer(ts(at)))
}

// ============================================================================
// GUARDED STATEMENTS
// ============================================================================

/// `WHERE` clause for a job guard, appended after `WHERE id = ?`.
fn job_guard_sql(guard: &JobGuard, sql: &mut String, values: &mut Vec<Value>) {
    if !guard.statuses.is_empty() {
        let marks = vec!["?"; guard.statuses.len()].join(", ");
        sql.push_str(&format!(" AND status IN ({})", marks));
        values.extend(guard.statuses.iter().map(|s| Value::Text(s.as_str().to_string())));
    }
    if let Some(agent) = guard.assigned_agent {
        sql.push_str(" AND assigned_agent IS ?");
        values.push(opt_uuid_value(agent));
    }
}

fn job_update(id: Uuid, guard: &JobGuard, patch: &JobPatch) -> (String, Vec<Value>) {
    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(status) = patch.status {
        sets.push("status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(agent) = patch.assigned_agent {
        sets.push("assigned_agent = ?");
        values.push(opt_uuid_value(agent));
    }
    if let Some(p) = patch.raise_progress {
        sets.push("progress = MAX(progress, ?)");
        values.push(Value::Real(p));
    }
    if let Some(w) = patch.raise_processed {
        sets.push("processed_words = MAX(processed_words, ?)");
        values.push(Value::Integer(w as i64));
    }
    if let Some(speed) = patch.speed {
        sets.push("speed = ?");
        values.push(Value::Real(speed));
    }
    if let Some(eta) = patch.eta {
        sets.push("eta = ?");
        values.push(opt_time_value(eta));
    }
    if let Some(ref result) = patch.result {
        sets.push("result = ?");
        values.push(Value::Text(result.clone()));
    }
    if let Some(reason) = patch.reason {
        sets.push("reason = ?");
        values.push(Value::Text(reason.as_str().to_string()));
    }
    if let Some(ref error) = patch.error {
        sets.push("error = ?");
        values.push(Value::Text(error.clone()));
    }
    if patch.clear_started {
        sets.push("started_at = NULL");
    }
    if let Some(at) = patch.stamp_started {
        sets.push("started_at = COALESCE(started_at, ?)");
        values.push(Value::Integer(ts(at)));
    }
    if let Some(at) = patch.completed_at {
        sets.push("completed_at = ?");
        values.push(Value::Integer(ts(at)));
    }
    if patch.bump_requeues {
        sets.push("requeues = requeues + 1");
    }
    if sets.is_empty() {
        sets.push("id = id");
    }

    let mut sql = format!("UPDATE jobs SET {} WHERE id = ?", sets.join(", "));
    values.push(Value::Text(id.to_string()));
    job_guard_sql(guard, &mut sql, &mut values);
    (sql, values)
}

fn agent_update(id: Uuid, guard: &AgentGuard, patch: &AgentPatch) -> (String, Vec<Value>) {
    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(status) = patch.status {
        sets.push("status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(job) = patch.current_job {
        sets.push("current_job = ?");
        values.push(opt_uuid_value(job));
    }
    if let Some(at) = patch.last_heartbeat {
        sets.push("last_heartbeat = ?");
        values.push(Value::Integer(ts(at)));
    }
    if sets.is_empty() {
        sets.push("id = id");
    }

    let mut sql = format!("UPDATE agents SET {} WHERE id = ?", sets.join(", "));
    values.push(Value::Text(id.to_string()));

    if !guard.statuses.is_empty() {
        let marks = vec!["?"; guard.statuses.len()].join(", ");
        sql.push_str(&format!(" AND status IN ({})", marks));
        values.extend(guard.statuses.iter().map(|s| Value::Text(s.as_str().to_string())));
    }
    if let Some(job) = guard.current_job {
        sql.push_str(" AND current_job IS ?");
        values.push(opt_uuid_value(job));
    }
    if let Some(cutoff) = guard.heartbeat_before {
        sql.push_str(" AND last_heartbeat < ?");
        values.push(Value::Integer(ts(cutoff)));
    }
    (sql, values)
}

fn job_delete(id: Uuid, guard: &JobGuard) -> (String, Vec<Value>) {
    let mut sql = "DELETE FROM jobs WHERE id = ?".to_string();
    let mut values = vec![Value::Text(id.to_string())];
    job_guard_sql(guard, &mut sql, &mut values);
    (sql, values)
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ============================================================================
// REPOSITORIES
// ============================================================================

#[async_trait]
impl AgentRepository for SqliteStore {
    async fn insert_agent(&self, agent: &Agent) -> Result<()> {
        let conn = self.conn.lock();

        let endpoint_taken: bool = conn
            .query_row(
                "SELECT 1 FROM agents WHERE name = ?1 AND address = ?2 AND port = ?3",
                params![agent.name, agent.address, agent.port],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if endpoint_taken {
            return Err(FleetError::AlreadyRegistered {
                name: agent.name.clone(),
                address: agent.address.clone(),
                port: agent.port,
            });
        }

        let key_taken: bool = conn
            .query_row(
                "SELECT 1 FROM agents WHERE registration_key = ?1",
                params![agent.registration_key],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if key_taken {
            return Err(FleetError::KeyInUse);
        }

        conn.execute(
            &format!(
                "INSERT INTO agents ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                AGENT_COLUMNS
            ),
            params![
                agent.id.to_string(),
                agent.name,
                agent.address,
                agent.port,
                agent.capabilities,
                agent.throughput,
                agent.status.as_str(),
                agent.current_job.map(|j| j.to_string()),
                agent.registration_key,
                ts(agent.last_heartbeat),
                ts(agent.registered_at),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                FleetError::AlreadyRegistered {
                    name: agent.name.clone(),
                    address: agent.address.clone(),
                    port: agent.port,
                }
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>> {
        let conn = self.conn.lock();
        let agent = conn
            .query_row(
                &format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS),
                params![id.to_string()],
                agent_from_row,
            )
            .optional()?;
        Ok(agent)
    }

    async fn find_agent(&self, name: &str, address: &str, port: u16) -> Result<Option<Agent>> {
        let conn = self.conn.lock();
        let agent = conn
            .query_row(
                &format!(
                    "SELECT {} FROM agents WHERE name = ?1 AND address = ?2 AND port = ?3",
                    AGENT_COLUMNS
                ),
                params![name, address, port],
                agent_from_row,
            )
            .optional()?;
        Ok(agent)
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM agents ORDER BY registered_at ASC, id ASC",
            AGENT_COLUMNS
        ))?;
        let agents = stmt
            .query_map([], agent_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    async fn delete_agent(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn.execute(
            "DELETE FROM agents WHERE id = ?1 AND current_job IS NULL",
            params![id.to_string()],
        )?;
        Ok(count == 1)
    }
}

#[async_trait]
impl JobRepository for SqliteStore {
    async fn insert_jobs(&self, jobs: &[Job]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, \
                 ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)",
                JOB_COLUMNS
            ))?;
            for job in jobs {
                stmt.execute(params![
                    job.id.to_string(),
                    job.name,
                    job.status.as_str(),
                    job.kind.as_str(),
                    job.hash_type,
                    job.attack_mode,
                    job.hash_file_id.to_string(),
                    job.wordlist_id.to_string(),
                    job.rules,
                    job.preferred_agent.map(|a| a.to_string()),
                    job.affinity.map(|a| a.to_string()),
                    job.assigned_agent.map(|a| a.to_string()),
                    job.parent_id.map(|p| p.to_string()),
                    job.keyspace.map(|r| r.start as i64),
                    job.keyspace.map(|r| r.end as i64),
                    job.progress,
                    job.speed,
                    job.eta.map(ts),
                    job.result,
                    job.reason.map(|r| r.as_str()),
                    job.error,
                    job.total_words as i64,
                    job.processed_words as i64,
                    job.requeues,
                    ts(job.created_at),
                    job.started_at.map(ts),
                    job.completed_at.map(ts),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let conn = self.conn.lock();
        let job = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id.to_string()],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM jobs {}", JOB_COLUMNS, FIFO_ORDER))?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    async fn children(&self, master_id: Uuid) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE parent_id = ?1 {}",
            JOB_COLUMNS, FIFO_ORDER
        ))?;
        let jobs = stmt
            .query_map(params![master_id.to_string()], job_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    async fn claimable_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE status = 'pending' AND kind != 'master' {}",
            JOB_COLUMNS, FIFO_ORDER
        ))?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    async fn next_job_for_agent(&self, agent: &Agent) -> Result<Option<Job>> {
        let Some(caps) = agent.capability_set() else {
            return Ok(None);
        };

        let mut sql = format!(
            "SELECT {} FROM jobs WHERE status = 'pending' AND kind != 'master' \
             AND (preferred_agent IS NULL OR preferred_agent = ?1)",
            JOB_COLUMNS
        );
        // Capability values are parsed integers, safe to inline.
        if let Some(types) = caps.hash_types() {
            let list: Vec<String> = types.iter().map(|t| t.to_string()).collect();
            sql.push_str(&format!(" AND hash_type IN ({})", list.join(", ")));
        }
        if let Some(modes) = caps.attack_modes() {
            let list: Vec<String> = modes.iter().map(|m| m.to_string()).collect();
            sql.push_str(&format!(" AND attack_mode IN ({})", list.join(", ")));
        }
        sql.push(' ');
        sql.push_str(FIFO_ORDER);
        sql.push_str(" LIMIT 1");

        let conn = self.conn.lock();
        let job = conn
            .query_row(&sql, params![agent.id.to_string()], job_from_row)
            .optional()?;
        Ok(job)
    }
}

#[async_trait]
impl HashFileRepository for SqliteStore {
    async fn insert_hash_file(&self, file: &HashFile) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO hash_files (id, name, hash_type, hash_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                file.id.to_string(),
                file.name,
                file.hash_type,
                file.hash_count as i64,
                ts(file.created_at),
            ],
        )?;
        Ok(())
    }

    async fn get_hash_file(&self, id: Uuid) -> Result<Option<HashFile>> {
        let conn = self.conn.lock();
        let file = conn
            .query_row(
                "SELECT id, name, hash_type, hash_count, created_at FROM hash_files WHERE id = ?1",
                params![id.to_string()],
                hash_file_from_row,
            )
            .optional()?;
        Ok(file)
    }

    async fn list_hash_files(&self) -> Result<Vec<HashFile>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, hash_type, hash_count, created_at FROM hash_files ORDER BY created_at",
        )?;
        let files = stmt
            .query_map([], hash_file_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(files)
    }
}

#[async_trait]
impl WordlistRepository for SqliteStore {
    async fn insert_wordlist(&self, wordlist: &Wordlist) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO wordlists (id, name, word_count, size_bytes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                wordlist.id.to_string(),
                wordlist.name,
                wordlist.word_count.map(|n| n as i64),
                wordlist.size_bytes as i64,
                ts(wordlist.created_at),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                FleetError::duplicate_wordlist(&wordlist.name)
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn get_wordlist(&self, id: Uuid) -> Result<Option<Wordlist>> {
        let conn = self.conn.lock();
        let wordlist = conn
            .query_row(
                "SELECT id, name, word_count, size_bytes, created_at FROM wordlists WHERE id = ?1",
                params![id.to_string()],
                wordlist_from_row,
            )
            .optional()?;
        Ok(wordlist)
    }

    async fn find_wordlist(&self, name: &str) -> Result<Option<Wordlist>> {
        let conn = self.conn.lock();
        let wordlist = conn
            .query_row(
                "SELECT id, name, word_count, size_bytes, created_at FROM wordlists
                 WHERE name = ?1 ORDER BY created_at LIMIT 1",
                params![name],
                wordlist_from_row,
            )
            .optional()?;
        Ok(wordlist)
    }

    async fn list_wordlists(&self) -> Result<Vec<Wordlist>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, word_count, size_bytes, created_at FROM wordlists ORDER BY created_at",
        )?;
        let lists = stmt
            .query_map([], wordlist_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(lists)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn apply(&self, batch: Vec<Mutation>) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for mutation in &batch {
            let (sql, values) = match mutation {
                Mutation::Job {
                    id, guard, patch, ..
                } => job_update(*id, guard, patch),
                Mutation::Agent {
                    id, guard, patch, ..
                } => agent_update(*id, guard, patch),
                Mutation::DeleteJob { id, guard, .. } => job_delete(*id, guard),
            };
            let touched = tx.execute(&sql, params_from_iter(values))?;
            if touched == 0 && mutation.is_required() {
                // Dropping the transaction rolls it back.
                return Ok(false);
            }
        }

        tx.commit()?;
        Ok(true)
    }
}
