use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;

use crate::backend::graph::Node;
use crate::error::Result;

/// Write-through persistence for graph nodes, one row per soul.
#[derive(Clone)]
pub struct NodeStore {
    conn: Arc<Mutex<Connection>>,
}

impl NodeStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn new_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS nodes (
                soul TEXT PRIMARY KEY,
                data BLOB
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn put_node(&self, soul: &str, node: &Node) -> Result<()> {
        let data = serde_json::to_vec(node)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO nodes (soul, data) VALUES (?1, ?2)",
            params![soul, data],
        )?;
        Ok(())
    }

    pub fn get_all_nodes(&self) -> Result<Vec<(String, Node)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT soul, data FROM nodes")?;
        let rows = stmt.query_map([], |row| {
            let soul: String = row.get(0)?;
            let data: Vec<u8> = row.get(1)?;
            Ok((soul, data))
        })?;

        let mut nodes = Vec::new();
        for row in rows {
            let (soul, data) = row?;
            match serde_json::from_slice::<Node>(&data) {
                Ok(node) => nodes.push((soul, node)),
                Err(e) => tracing::warn!(%soul, error = %e, "skipping unreadable node"),
            }
        }
        Ok(nodes)
    }

    /// `(node_count, total_bytes)`
    pub fn storage_stats(&self) -> Result<(usize, usize)> {
        let conn = self.conn.lock();
        let (count, bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(LENGTH(data)), 0) FROM nodes",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((count as usize, bytes as usize))
    }
}
