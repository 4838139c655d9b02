use crate::core::error;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, error::FieldreqError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(error::FieldreqError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::FieldreqError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::FieldreqError::RusqliteError)?;
    Ok(conn)
}

pub fn requirements_db_path(root: &Path) -> PathBuf {
    root.join(schemas::REQUIREMENTS_DB_NAME)
}

pub fn initialize_requirements_db(root: &Path) -> Result<(), error::FieldreqError> {
    let db_path = requirements_db_path(root);
    if let Some(parent_dir) = db_path.parent() {
        fs::create_dir_all(parent_dir).map_err(error::FieldreqError::IoError)?;
    }

    let broker = crate::core::broker::DbBroker::new(root);
    broker.with_conn(&db_path, "fieldreq", None, "requirements.init", |conn| {
        conn.execute(schemas::PAYER_REQUIREMENTS_SCHEMA, [])?;
        conn.execute(schemas::PAYER_REQUIREMENTS_INDEX, [])?;
        conn.execute(schemas::ORG_POLICIES_SCHEMA, [])?;
        conn.execute(schemas::ORG_POLICIES_INDEX, [])?;
        conn.execute(schemas::CHANGE_AUDIT_SCHEMA, [])?;
        conn.execute(schemas::CHANGE_AUDIT_INDEX, [])?;
        conn.execute(schemas::ENDPOINTS_SCHEMA, [])?;
        conn.execute(schemas::EFFECTIVE_REQUIREMENTS_SCHEMA, [])?;
        conn.execute(schemas::EFFECTIVE_REQUIREMENTS_INDEX, [])?;
        conn.execute(schemas::CACHE_META_SCHEMA, [])?;
        conn.execute(schemas::CACHE_META_SEED, [])?;
        Ok(())
    })
}
