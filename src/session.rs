//! Session files: a small sqlite store that measurement commands append
//! received reports to.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA: &str = "
CREATE TABLE vibreshark_schema (
    version INTEGER
);
CREATE TABLE session_info (
    created_at INTEGER
);
CREATE TABLE avss_report (
    received_at INTEGER,
    node_id TEXT,
    report_type INTEGER,
    payload_cbor BLOB
);
";

pub struct SessionFile {
    conn: Connection,
}

impl SessionFile {
    /// Open (or create) a session file for writing.
    pub fn create(path: &Path) -> Result<Self> {
        let exists = path.exists();
        let conn = Connection::open(path)
            .with_context(|| format!("cannot open session file {}", path.display()))?;
        let file = SessionFile { conn };
        if exists {
            file.check_version()?;
        } else {
            file.initialize_schema()?;
        }
        Ok(file)
    }

    fn check_version(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .query_row("SELECT version FROM vibreshark_schema", [], |row| row.get(0))
            .context("unrecognized file format")?;
        if version != SCHEMA_VERSION {
            bail!("unsupported file version: {version}");
        }
        Ok(())
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch(CREATE_SCHEMA)?;
        self.conn.execute(
            "INSERT INTO vibreshark_schema (version) VALUES (?1)",
            [SCHEMA_VERSION],
        )?;
        Ok(())
    }

    pub fn update_session_info(&self, created_at: i64) -> Result<()> {
        self.conn.execute("DELETE FROM session_info", [])?;
        self.conn.execute(
            "INSERT INTO session_info (created_at) VALUES (?1)",
            [created_at],
        )?;
        Ok(())
    }

    pub fn insert_avss_report(
        &self,
        received_at: i64,
        node_id: &str,
        report_type: u8,
        payload_cbor: &[u8],
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO avss_report (received_at, node_id, report_type, payload_cbor)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![received_at, node_id, report_type, payload_cbor],
        )?;
        Ok(())
    }
}
