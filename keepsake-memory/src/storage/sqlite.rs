//! SQLite storage for item records and promotion aliases

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::memory::{
    ContentItem, ContentType, ItemMetadata, ListFilter, ProjectContext, Scope, SortBy, Tier,
};

const ITEM_COLUMNS: &str = r#"
    id, name, tier, item_type, content, tags, importance, retrieval_count,
    created_at, modified_at, last_retrieved_at, project_dir, branch,
    relevant_files, scope, durable_path, promoted_from, promoted_at
"#;

/// Timestamps are stored with fixed precision so they sort as text
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::storage(format!("Bad timestamp '{}': {}", raw, e)))
}

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Create a new SQLite storage
    pub fn new(config: &Config) -> Result<Self> {
        let conn = Connection::open(config.sqlite_path())?;

        // Hook processes may hit the database concurrently
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::storage(e.to_string()))
    }

    /// Insert or refresh an item. `created_at` is kept from the first insert
    /// and `retrieval_count` can only grow.
    pub fn save_item(&self, item: &ContentItem) -> Result<()> {
        let conn = self.lock()?;
        upsert_item(&conn, item)
    }

    /// Get an item by exact id
    pub fn get_item(&self, id: &str) -> Result<Option<ContentItem>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM items WHERE id = ?1", ITEM_COLUMNS);
        let row = conn
            .query_row(&sql, params![id], ItemRow::from_row)
            .optional()?;
        row.map(ItemRow::into_item).transpose()
    }

    /// Most recently modified item carrying `name`
    pub fn find_by_name(&self, name: &str) -> Result<Option<ContentItem>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM items WHERE name = ?1 ORDER BY modified_at DESC LIMIT 1",
            ITEM_COLUMNS
        );
        let row = conn
            .query_row(&sql, params![name], ItemRow::from_row)
            .optional()?;
        row.map(ItemRow::into_item).transpose()
    }

    /// List items with optional filters
    pub fn list_items(&self, filter: &ListFilter) -> Result<Vec<ContentItem>> {
        let conn = self.lock()?;

        let mut sql = format!("SELECT {} FROM items WHERE 1=1", ITEM_COLUMNS);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(tier) = filter.tier {
            sql.push_str(" AND tier = ?");
            params_vec.push(Box::new(tier.to_string()));
        }

        if let Some(item_type) = filter.item_type {
            sql.push_str(" AND item_type = ?");
            params_vec.push(Box::new(item_type.to_string()));
        }

        if let Some(min) = filter.min_importance {
            sql.push_str(" AND importance >= ?");
            params_vec.push(Box::new(f64::from(min)));
        }

        if let Some(project) = &filter.project_dir {
            sql.push_str(" AND project_dir = ?");
            params_vec.push(Box::new(project.clone()));
        }

        if !filter.include_promoted {
            sql.push_str(
                " AND NOT (tier = 'ephemeral' AND id IN (SELECT alias FROM aliases))",
            );
        }

        match filter.sort_by {
            SortBy::ImportanceDesc => sql.push_str(" ORDER BY importance DESC, created_at DESC"),
            SortBy::ImportanceAsc => sql.push_str(" ORDER BY importance ASC, created_at ASC"),
            SortBy::CreatedDesc => sql.push_str(" ORDER BY created_at DESC"),
            SortBy::CreatedAsc => sql.push_str(" ORDER BY created_at ASC"),
            SortBy::None => {}
        }

        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            params_vec.push(Box::new(limit as i64));
        }

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let rows = stmt.query_map(params_refs.as_slice(), ItemRow::from_row)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?.into_item()?);
        }

        Ok(items)
    }

    /// Delete an item and every alias pointing at or from it
    pub fn delete_item(&self, id: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM items WHERE id = ?1", params![id])?;
        tx.execute(
            "DELETE FROM aliases WHERE alias = ?1 OR target_id = ?1",
            params![id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Bump retrieval stats for each id
    pub fn record_retrievals(&self, ids: &[&str], at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                UPDATE items
                SET retrieval_count = retrieval_count + 1, last_retrieved_at = ?1
                WHERE id = ?2
                "#,
            )?;
            let at = ts(at);
            for id in ids {
                stmt.execute(params![at, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Follow a promotion alias
    pub fn resolve_alias(&self, alias: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT target_id FROM aliases WHERE alias = ?1",
            params![alias],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    /// Whether `id` has been promoted and now redirects elsewhere
    pub fn is_aliased(&self, id: &str) -> Result<bool> {
        Ok(self.resolve_alias(id)?.is_some())
    }

    /// Undo a promotion whose durable file is gone, in one transaction: drop
    /// the durable row and every alias to it, then put `restored` back when
    /// the original ephemeral row no longer exists.
    pub fn detach_promotion(&self, durable_id: &str, restored: Option<&ContentItem>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM items WHERE id = ?1", params![durable_id])?;
        tx.execute(
            "DELETE FROM aliases WHERE alias = ?1 OR target_id = ?1",
            params![durable_id],
        )?;
        if let Some(item) = restored {
            upsert_item(&tx, item)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Record a promotion in one transaction: insert the durable item, alias
    /// the old id to it, and optionally drop the ephemeral row.
    pub fn commit_promotion(
        &self,
        durable: &ContentItem,
        ephemeral_id: &str,
        drop_ephemeral: bool,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        upsert_item(&tx, durable)?;
        tx.execute(
            r#"
            INSERT INTO aliases (alias, target_id, created_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(alias) DO UPDATE SET target_id = excluded.target_id
            "#,
            params![ephemeral_id, durable.id, ts(Utc::now())],
        )?;
        if drop_ephemeral {
            tx.execute("DELETE FROM items WHERE id = ?1", params![ephemeral_id])?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn upsert_item(conn: &Connection, item: &ContentItem) -> Result<()> {
    let meta = &item.metadata;
    conn.execute(
        r#"
        INSERT INTO items (
            id, name, tier, item_type, content, tags, importance, retrieval_count,
            created_at, modified_at, last_retrieved_at, project_dir, branch,
            relevant_files, scope, durable_path, promoted_from, promoted_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            tier = excluded.tier,
            item_type = excluded.item_type,
            content = excluded.content,
            tags = excluded.tags,
            importance = excluded.importance,
            retrieval_count = MAX(items.retrieval_count, excluded.retrieval_count),
            modified_at = excluded.modified_at,
            project_dir = excluded.project_dir,
            branch = excluded.branch,
            relevant_files = excluded.relevant_files,
            scope = excluded.scope,
            durable_path = excluded.durable_path,
            promoted_from = excluded.promoted_from,
            promoted_at = excluded.promoted_at
        "#,
        params![
            item.id,
            item.name,
            item.tier.to_string(),
            meta.item_type.to_string(),
            item.content,
            serde_json::to_string(&meta.tags)?,
            f64::from(meta.importance),
            meta.retrieval_count,
            ts(meta.created_at),
            ts(meta.modified_at),
            meta.last_retrieved_at.map(ts),
            meta.project.project_dir,
            meta.project.branch,
            serde_json::to_string(&meta.relevant_files)?,
            meta.scope.map(|s| s.to_string()),
            item.durable_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            item.promoted_from,
            item.promoted_at.map(ts),
        ],
    )?;
    Ok(())
}

/// Intermediate struct for reading from SQLite
struct ItemRow {
    id: String,
    name: Option<String>,
    tier: String,
    item_type: String,
    content: String,
    tags: String,
    importance: f64,
    retrieval_count: u32,
    created_at: String,
    modified_at: String,
    last_retrieved_at: Option<String>,
    project_dir: Option<String>,
    branch: Option<String>,
    relevant_files: String,
    scope: Option<String>,
    durable_path: Option<String>,
    promoted_from: Option<String>,
    promoted_at: Option<String>,
}

impl ItemRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            tier: row.get(2)?,
            item_type: row.get(3)?,
            content: row.get(4)?,
            tags: row.get(5)?,
            importance: row.get(6)?,
            retrieval_count: row.get(7)?,
            created_at: row.get(8)?,
            modified_at: row.get(9)?,
            last_retrieved_at: row.get(10)?,
            project_dir: row.get(11)?,
            branch: row.get(12)?,
            relevant_files: row.get(13)?,
            scope: row.get(14)?,
            durable_path: row.get(15)?,
            promoted_from: row.get(16)?,
            promoted_at: row.get(17)?,
        })
    }

    fn into_item(self) -> Result<ContentItem> {
        Ok(ContentItem {
            id: self.id,
            name: self.name,
            tier: Tier::from_str(&self.tier)?,
            content: self.content,
            metadata: ItemMetadata {
                item_type: ContentType::from_str(&self.item_type)?,
                tags: serde_json::from_str(&self.tags)?,
                importance: self.importance as f32,
                retrieval_count: self.retrieval_count,
                created_at: parse_ts(&self.created_at)?,
                modified_at: parse_ts(&self.modified_at)?,
                last_retrieved_at: self.last_retrieved_at.as_deref().map(parse_ts).transpose()?,
                project: ProjectContext {
                    project_dir: self.project_dir,
                    branch: self.branch,
                },
                relevant_files: serde_json::from_str(&self.relevant_files)?,
                scope: self.scope.as_deref().map(Scope::from_str).transpose()?,
            },
            durable_path: self.durable_path.map(PathBuf::from),
            promoted_from: self.promoted_from,
            promoted_at: self.promoted_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}
