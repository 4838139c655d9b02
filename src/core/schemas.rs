//! Centralized database schema definitions for the consolidated requirements bin.
//!
//! Fieldreq keeps one SQLite database (`requirements.db`) with six tables:
//! 1. payer_requirements: versioned, effective-dated base standards per (payer, task type).
//! 2. org_policies: organization override policies, versioned per scope.
//! 3. change_audit: append-only compliance ledger, written in the same
//!    transaction as the mutation it records.
//! 4. endpoints: the minimal endpoint directory slice the cache enumerates.
//! 5. effective_requirements: the persisted cache snapshot. Derived data only;
//!    dropping it loses nothing.
//! 6. cache_meta: a one-row write-generation counter, bumped inside every
//!    mutation transaction so snapshot readers can detect staleness.

pub const REQUIREMENTS_DB_NAME: &str = "requirements.db";

pub const PAYER_REQUIREMENTS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS payer_requirements (
        requirement_id TEXT PRIMARY KEY,
        payer_id TEXT NOT NULL,
        task_type_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        required_fields TEXT NOT NULL DEFAULT '[]', -- JSON array
        optional_fields TEXT NOT NULL DEFAULT '[]', -- JSON array
        field_rules TEXT NOT NULL DEFAULT '{}',     -- JSON object: field -> rule
        compliance_ref TEXT,
        effective_date TEXT NOT NULL,               -- YYYY-MM-DD
        created_at TEXT NOT NULL,
        created_by TEXT NOT NULL,
        UNIQUE(payer_id, task_type_id, version)
    )
";
pub const PAYER_REQUIREMENTS_INDEX: &str = "
    CREATE INDEX IF NOT EXISTS idx_payer_requirements_key
    ON payer_requirements(payer_id, task_type_id, effective_date)
";

pub const ORG_POLICIES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS org_policies (
        policy_id TEXT PRIMARY KEY,
        org_id TEXT NOT NULL,
        task_type_id TEXT NOT NULL,
        payer_id TEXT,                              -- NULL = all payers for this org/task
        policy_type TEXT NOT NULL CHECK (policy_type IN ('add', 'remove', 'override')),
        field_changes TEXT NOT NULL,                -- JSON object
        reason TEXT NOT NULL,
        version INTEGER NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        created_by TEXT NOT NULL,
        approved_by TEXT,
        approved_at TEXT
    )
";
pub const ORG_POLICIES_INDEX: &str = "
    CREATE INDEX IF NOT EXISTS idx_org_policies_scope
    ON org_policies(org_id, task_type_id, active)
";

pub const CHANGE_AUDIT_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS change_audit (
        audit_id TEXT PRIMARY KEY,
        source_entity TEXT NOT NULL,
        source_id TEXT NOT NULL,
        change_type TEXT NOT NULL CHECK (change_type IN ('insert', 'update', 'delete')),
        previous_value TEXT,                        -- JSON snapshot
        new_value TEXT,                             -- JSON snapshot
        changed_by TEXT NOT NULL,
        changed_at TEXT NOT NULL
    )
";
pub const CHANGE_AUDIT_INDEX: &str = "
    CREATE INDEX IF NOT EXISTS idx_change_audit_source
    ON change_audit(source_entity, source_id)
";

pub const ENDPOINTS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS endpoints (
        endpoint_id TEXT PRIMARY KEY,
        org_id TEXT NOT NULL,
        payer_id TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
";

pub const EFFECTIVE_REQUIREMENTS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS effective_requirements (
        endpoint_id TEXT NOT NULL,
        org_id TEXT NOT NULL,
        payer_id TEXT NOT NULL,
        task_type_id TEXT NOT NULL,
        required_fields TEXT NOT NULL,
        optional_fields TEXT NOT NULL,
        field_rules TEXT NOT NULL,
        compliance_ref TEXT,
        computed_at TEXT NOT NULL,
        PRIMARY KEY (endpoint_id, task_type_id)
    )
";
pub const EFFECTIVE_REQUIREMENTS_INDEX: &str = "
    CREATE INDEX IF NOT EXISTS idx_effective_requirements_org
    ON effective_requirements(org_id)
";

pub const CACHE_META_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS cache_meta (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        generation INTEGER NOT NULL
    )
";
pub const CACHE_META_SEED: &str = "
    INSERT OR IGNORE INTO cache_meta(id, generation) VALUES(1, 0)
";
