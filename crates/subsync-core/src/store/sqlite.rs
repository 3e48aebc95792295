//! `SQLite`-backed subscription store.
//!
//! One connection guarded by a mutex, WAL journal, schema applied on open.
//! Claims run in `BEGIN IMMEDIATE` transactions so two processes sharing a
//! database file serialize on the write lock instead of both reading the
//! same unclaimed row.

// SQLite returns i64 for counts, which are never negative.
#![allow(clippy::cast_sign_loss)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{
    Connection, ErrorCode, OpenFlags, OptionalExtension, Row, TransactionBehavior, params,
};

use super::records::{
    Account, AccountId, ClaimAttempt, NewAccount, NewPending, PendingClaim, PendingId,
    PendingSubscription, StoreStats, SubscriptionStatus, SubscriptionUpdate, UniqueField,
};
use super::{StoreError, SubscriptionBackend};
use crate::credentials::PasswordCredential;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// How long a writer waits for another connection's lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ACCOUNT_COLUMNS: &str = "id, email, username, credential, name, payment_customer_ref, \
                               subscription_status, subscription_expires_at, created_at";

const PENDING_COLUMNS: &str =
    "id, payment_email, payment_customer_ref, paid_at, claimed_by, claimed_at";

/// Subscription store backed by a single `SQLite` database.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteBackend {
    /// Opens or creates the database at `path`, creating parent directories
    /// as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or database cannot be created or the
    /// schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::initialize_connection(&conn)?;

        tracing::debug!(path = %path.display(), "opened subscription store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Database file, or `None` for an in-memory store.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Names of the tables in the schema, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn initialize_connection(conn: &Connection) -> Result<(), StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    pub(super) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl SubscriptionBackend for SqliteBackend {
    fn insert_account(&self, account: &NewAccount) -> Result<Account, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let taken: Option<String> = tx
            .query_row(
                "SELECT email FROM accounts WHERE email = ?1 OR username = ?2 LIMIT 1",
                params![account.email, account.username],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(email) = taken {
            let field = if email == account.email {
                UniqueField::Email
            } else {
                UniqueField::Username
            };
            return Err(StoreError::Conflict { field });
        }

        tx.execute(
            "INSERT INTO accounts (email, username, credential, name,
                                   subscription_status, subscription_expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                account.email,
                account.username,
                account.credential.as_stored(),
                account.name,
                account.status.as_str(),
                account.expires_at.map(|t| t.timestamp()),
                account.created_at.timestamp(),
            ],
        )
        .map_err(unique_violation)?;
        let id = AccountId(tx.last_insert_rowid());
        tx.commit()?;

        Ok(Account {
            id,
            email: account.email.clone(),
            username: account.username.clone(),
            credential: account.credential.clone(),
            name: account.name.clone(),
            payment_customer_ref: None,
            status: account.status,
            expires_at: account.expires_at,
            created_at: account.created_at,
        })
    }

    fn account_by_id(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![id.0], account_from_row)
            .optional()?)
    }

    fn account_by_email(&self, email: &str) -> Result<Option<Account>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE email = ?1");
        Ok(conn
            .query_row(&sql, params![email], account_from_row)
            .optional()?)
    }

    fn account_by_username(&self, username: &str) -> Result<Option<Account>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE username = ?1");
        Ok(conn
            .query_row(&sql, params![username], account_from_row)
            .optional()?)
    }

    fn update_subscription(
        &self,
        id: AccountId,
        update: &SubscriptionUpdate,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        Ok(write_subscription(&conn, id, update)?)
    }

    fn insert_pending(&self, pending: &NewPending) -> Result<PendingSubscription, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO pending_subscriptions (payment_email, payment_customer_ref, paid_at)
             VALUES (?1, ?2, ?3)",
            params![
                pending.payment_email,
                pending.payment_customer_ref,
                pending.paid_at.timestamp(),
            ],
        )?;

        Ok(PendingSubscription {
            id: PendingId(conn.last_insert_rowid()),
            payment_email: pending.payment_email.clone(),
            payment_customer_ref: pending.payment_customer_ref.clone(),
            paid_at: pending.paid_at,
            claimed_by: None,
            claimed_at: None,
        })
    }

    fn pending_by_id(&self, id: PendingId) -> Result<Option<PendingSubscription>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {PENDING_COLUMNS} FROM pending_subscriptions WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![id.0], pending_from_row)
            .optional()?)
    }

    fn oldest_unclaimed(
        &self,
        email: &str,
        customer_ref: Option<&str>,
    ) -> Result<Option<PendingSubscription>, StoreError> {
        let conn = self.lock()?;
        Ok(query_oldest_unclaimed(&conn, email, customer_ref)?)
    }

    fn pending_for_email(&self, email: &str) -> Result<Vec<PendingSubscription>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {PENDING_COLUMNS} FROM pending_subscriptions
             WHERE payment_email = ?1
             ORDER BY paid_at ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![email], pending_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn claim_pending(&self, claim: &PendingClaim<'_>) -> Result<ClaimAttempt, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(candidate) = query_oldest_unclaimed(&tx, claim.payment_email, None)? else {
            return Ok(ClaimAttempt::NothingToClaim);
        };

        let update = SubscriptionUpdate {
            payment_customer_ref: Some(candidate.payment_customer_ref.clone()),
            ..claim.update.clone()
        };
        if !write_subscription(&tx, claim.claimant, &update)? {
            // Dropping the transaction rolls it back.
            return Ok(ClaimAttempt::ClaimantMissing);
        }

        let marked = tx.execute(
            "UPDATE pending_subscriptions
             SET claimed_by = ?1, claimed_at = ?2
             WHERE id = ?3 AND claimed_by IS NULL",
            params![
                claim.claimant.0,
                claim.claimed_at.timestamp(),
                candidate.id.0
            ],
        )?;
        if marked == 0 {
            return Ok(ClaimAttempt::NothingToClaim);
        }

        tx.commit()?;

        Ok(ClaimAttempt::Claimed(PendingSubscription {
            claimed_by: Some(claim.claimant),
            claimed_at: Some(claim.claimed_at),
            ..candidate
        }))
    }

    fn delivery_processed(&self, event_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let seen = conn
            .query_row(
                "SELECT 1 FROM processed_deliveries WHERE event_id = ?1",
                params![event_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(seen.is_some())
    }

    fn record_delivery(
        &self,
        event_id: &str,
        event_kind: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO processed_deliveries (event_id, event_kind, processed_at)
             VALUES (?1, ?2, ?3)",
            params![event_id, event_kind, processed_at.timestamp()],
        )?;
        Ok(())
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.lock()?;
        let count = |sql: &str| -> Result<u64, StoreError> {
            Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as u64)
        };

        let schema_version: String = conn.query_row(
            "SELECT value FROM schema_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            account_count: count("SELECT COUNT(*) FROM accounts")?,
            active_flag_count: count(
                "SELECT COUNT(*) FROM accounts WHERE subscription_status = 'active'",
            )?,
            pending_count: count("SELECT COUNT(*) FROM pending_subscriptions")?,
            unclaimed_count: count(
                "SELECT COUNT(*) FROM pending_subscriptions WHERE claimed_by IS NULL",
            )?,
            delivery_count: count("SELECT COUNT(*) FROM processed_deliveries")?,
            schema_version: schema_version.parse().map_err(|_| {
                StoreError::Corrupt(format!("schema_version {schema_version:?}"))
            })?,
        })
    }
}

/// The only statement that writes subscription fields.
fn write_subscription(
    conn: &Connection,
    id: AccountId,
    update: &SubscriptionUpdate,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE accounts
         SET payment_customer_ref = COALESCE(?2, payment_customer_ref),
             subscription_status = ?3,
             subscription_expires_at = ?4
         WHERE id = ?1",
        params![
            id.0,
            update.payment_customer_ref,
            update.status.as_str(),
            update.expires_at.timestamp(),
        ],
    )?;
    Ok(changed > 0)
}

fn query_oldest_unclaimed(
    conn: &Connection,
    email: &str,
    customer_ref: Option<&str>,
) -> rusqlite::Result<Option<PendingSubscription>> {
    let sql = format!(
        "SELECT {PENDING_COLUMNS} FROM pending_subscriptions
         WHERE payment_email = ?1
           AND claimed_by IS NULL
           AND (?2 IS NULL OR payment_customer_ref = ?2)
         ORDER BY paid_at ASC, id ASC
         LIMIT 1"
    );
    conn.query_row(&sql, params![email, customer_ref], pending_from_row)
        .optional()
}

fn unique_violation(err: rusqlite::Error) -> StoreError {
    if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
        if let rusqlite::Error::SqliteFailure(_, Some(message)) = &err {
            if message.contains("accounts.email") {
                return StoreError::Conflict {
                    field: UniqueField::Email,
                };
            }
            if message.contains("accounts.username") {
                return StoreError::Conflict {
                    field: UniqueField::Username,
                };
            }
        }
    }
    StoreError::Database(err)
}

fn timestamp(idx: usize, secs: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp {secs} out of range").into(),
        )
    })
}

fn optional_timestamp(idx: usize, secs: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    secs.map(|s| timestamp(idx, s)).transpose()
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let status: String = row.get(6)?;
    let status = status
        .parse::<SubscriptionStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    Ok(Account {
        id: AccountId(row.get(0)?),
        email: row.get(1)?,
        username: row.get(2)?,
        credential: PasswordCredential::from_stored(row.get::<_, String>(3)?),
        name: row.get(4)?,
        payment_customer_ref: row.get(5)?,
        status,
        expires_at: optional_timestamp(7, row.get(7)?)?,
        created_at: timestamp(8, row.get(8)?)?,
    })
}

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<PendingSubscription> {
    Ok(PendingSubscription {
        id: PendingId(row.get(0)?),
        payment_email: row.get(1)?,
        payment_customer_ref: row.get(2)?,
        paid_at: timestamp(3, row.get(3)?)?,
        claimed_by: row.get::<_, Option<i64>>(4)?.map(AccountId),
        claimed_at: optional_timestamp(5, row.get(5)?)?,
    })
}
