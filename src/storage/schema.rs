//! Database schema constants.
//!
//! This module contains the SQL schema definitions for the PostgreSQL
//! account store.

/// SQL schema for creating the tracked_accounts table.
pub const CREATE_TRACKED_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tracked_accounts (
    id BIGSERIAL PRIMARY KEY,
    owner_ref VARCHAR(255) NOT NULL UNIQUE,
    api_key TEXT NOT NULL,
    last_seen_marker BIGINT,
    last_checked_at TIMESTAMPTZ,
    locked_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the subscriptions table.
pub const CREATE_SUBSCRIPTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS subscriptions (
    id BIGSERIAL PRIMARY KEY,
    account_id BIGINT NOT NULL REFERENCES tracked_accounts(id) ON DELETE CASCADE ON UPDATE CASCADE,
    destination VARCHAR(255) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE(account_id, destination)
)
"#;

/// Index serving the scanner's staleness predicate.
pub const CREATE_UNLOCKED_CHECKED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_tracked_accounts_unlocked_checked
    ON tracked_accounts(last_checked_at) WHERE locked_at IS NULL
"#;

/// Index serving the reaper's expiry predicate.
pub const CREATE_LOCKED_AT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_tracked_accounts_locked_at
    ON tracked_accounts(locked_at) WHERE locked_at IS NOT NULL
"#;

/// Index for subscription lookups during fan-out.
pub const CREATE_SUBSCRIPTIONS_ACCOUNT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_subscriptions_account_id ON subscriptions(account_id)
"#;

/// Table names in the schema.
pub mod tables {
    /// Tracked accounts table name.
    pub const TRACKED_ACCOUNTS: &str = "tracked_accounts";
    /// Subscriptions table name.
    pub const SUBSCRIPTIONS: &str = "subscriptions";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_column_is_nullable() {
        assert!(CREATE_TRACKED_ACCOUNTS_TABLE.contains("locked_at TIMESTAMPTZ,"));
        assert!(CREATE_SUBSCRIPTIONS_TABLE.contains("UNIQUE(account_id, destination)"));
    }
}
