//! Append-only archive of account state, one block update at a time.
//!
//! Every [`Archive::add`] records a whole-block diff across six typed tables
//! plus a per-account hash chain, all inside one transaction. Point-in-time
//! getters answer "value at block B" as the most recent write at any block at
//! or below B, and [`Archive::verify`] re-derives the archive commitment from
//! the raw rows.
//!
//! Storage writes are tagged with a per-account reincarnation counter that
//! increments on every create or delete, so a destroyed-and-recreated account
//! never reads storage written before the destruction.

mod db;
mod verify;

use std::mem;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use state_archive_common::{combine, Address, Bytes, Hasher, Update, B256, U128};

/// Name of the database file inside the archive directory.
const ARCHIVE_FILE: &str = "archive.sqlite";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The archive was closed; no further operations are possible.
    #[error("archive is closed")]
    Closed,

    #[error("cannot insert block {block}, archive already contains block {newest}")]
    NonMonotonicBlock { block: u64, newest: u64 },

    /// Block heights live in a signed 64-bit column.
    #[error("block {0} exceeds the maximum storable height")]
    BlockOutOfRange(u64),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected {column} length: expected {expected}, got {got}")]
    InvalidColumn {
        column: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("encountered database integrity issues:\n{issues}")]
    Corrupted { issues: String },

    #[error("archive hash at block {block} does not match the expected hash")]
    ArchiveHashMismatch { block: u64 },

    #[error("hash for account {account} at block {block} does not match")]
    AccountHashMismatch { account: Address, block: u64 },

    #[error("account {account} has an update at block {block} but no hash for it")]
    MissingHash { account: Address, block: u64 },

    #[error("account {account} has a hash at block {block} but no data")]
    DanglingHash { account: Address, block: u64 },

    #[error("multiple updates for the same information of account {account} in block {block}")]
    DuplicateUpdate { account: Address, block: u64 },

    #[error("table `{table}` contains rows without a matching account hash")]
    ExtraRows { table: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;

// See reference: https://www.sqlite.org/lang.html

// -- Blocks --

const CREATE_BLOCK_TABLE: &str = "CREATE TABLE IF NOT EXISTS block (number INT PRIMARY KEY)";

const ADD_BLOCK: &str = "INSERT INTO block(number) VALUES (?)";

const GET_BLOCK_HEIGHT: &str = "SELECT number FROM block ORDER BY number DESC LIMIT 1";

// -- Account hashes --

const CREATE_ACCOUNT_HASH_TABLE: &str = "CREATE TABLE IF NOT EXISTS account_hash \
    (account BLOB, block INT, hash BLOB, PRIMARY KEY(account,block))";

const ADD_ACCOUNT_HASH: &str = "INSERT INTO account_hash(account, block, hash) VALUES (?,?,?)";

const GET_ACCOUNT_HASH: &str = "SELECT hash FROM account_hash WHERE account = ? AND block <= ? \
    ORDER BY block DESC LIMIT 1";

const GET_ARCHIVE_HASH: &str = "SELECT hash FROM account_hash a INNER JOIN \
    (SELECT account, MAX(block) as block FROM account_hash WHERE block <= ? GROUP BY account) b \
    ON a.account = b.account AND a.block = b.block ORDER BY a.account";

const GET_ACCOUNT_LIST: &str =
    "SELECT DISTINCT account FROM account_hash WHERE block <= ? ORDER BY account";

// -- Account status --

const CREATE_STATUS_TABLE: &str = "CREATE TABLE IF NOT EXISTS status \
    (account BLOB, block INT, exist INT, reincarnation INT, PRIMARY KEY (account,block))";

const CREATE_ACCOUNT: &str = "INSERT INTO status(account,block,exist,reincarnation) VALUES \
    (?,?,1,(SELECT IFNULL(MAX(reincarnation)+1,0) FROM status WHERE account = ?))";

const DELETE_ACCOUNT: &str = "INSERT INTO status(account,block,exist,reincarnation) VALUES \
    (?,?,0,(SELECT IFNULL(MAX(reincarnation)+1,0) FROM status WHERE account = ?))";

const GET_STATUS: &str = "SELECT exist FROM status WHERE account = ? AND block <= ? \
    ORDER BY block DESC LIMIT 1";

// -- Balance --

const CREATE_BALANCE_TABLE: &str = "CREATE TABLE IF NOT EXISTS balance \
    (account BLOB, block INT, value BLOB, PRIMARY KEY (account,block))";

const ADD_BALANCE: &str = "INSERT INTO balance(account,block,value) VALUES (?,?,?)";

const GET_BALANCE: &str = "SELECT value FROM balance WHERE account = ? AND block <= ? \
    ORDER BY block DESC LIMIT 1";

// -- Code --

const CREATE_CODE_TABLE: &str = "CREATE TABLE IF NOT EXISTS code \
    (account BLOB, block INT, code BLOB, PRIMARY KEY (account,block))";

const ADD_CODE: &str = "INSERT INTO code(account,block,code) VALUES (?,?,?)";

const GET_CODE: &str = "SELECT code FROM code WHERE account = ? AND block <= ? \
    ORDER BY block DESC LIMIT 1";

// -- Nonces --

const CREATE_NONCE_TABLE: &str = "CREATE TABLE IF NOT EXISTS nonce \
    (account BLOB, block INT, value BLOB, PRIMARY KEY (account,block))";

const ADD_NONCE: &str = "INSERT INTO nonce(account,block,value) VALUES (?,?,?)";

const GET_NONCE: &str = "SELECT value FROM nonce WHERE account = ? AND block <= ? \
    ORDER BY block DESC LIMIT 1";

// -- Storage --

const CREATE_STORAGE_TABLE: &str = "CREATE TABLE IF NOT EXISTS storage \
    (account BLOB, reincarnation INT, slot BLOB, block INT, value BLOB, \
    PRIMARY KEY (account,reincarnation,slot,block))";

const ADD_STORAGE: &str = "INSERT INTO storage(account,reincarnation,slot,block,value) VALUES \
    (?,(SELECT IFNULL(MAX(reincarnation),0) FROM status WHERE account = ? AND block <= ?),?,?,?)";

const GET_STORAGE: &str = "SELECT value FROM storage WHERE account = ? AND reincarnation = \
    (SELECT IFNULL(MAX(reincarnation),0) FROM status WHERE account = ? AND block <= ?) \
    AND slot = ? AND block <= ? ORDER BY block DESC LIMIT 1";

/// Versioned archive of account state backed by a single SQLite file.
///
/// Blocks are appended with strictly increasing heights and never rewritten.
/// The handle is `Send + Sync`; operations serialize on the connection, and a
/// concurrent `add` simply waits its turn.
pub struct Archive {
    conn: Mutex<Option<Connection>>,
}

impl Archive {
    /// Open the archive stored in `directory/archive.sqlite`, creating the
    /// file and schema if they do not exist yet. Schema creation is
    /// idempotent, so reopening an existing archive is safe.
    pub fn open(directory: impl AsRef<Path>) -> Result<Self> {
        let path = directory.as_ref().join(ARCHIVE_FILE);
        let conn = db::open(&path)?;

        for ddl in [
            CREATE_BLOCK_TABLE,
            CREATE_ACCOUNT_HASH_TABLE,
            CREATE_STATUS_TABLE,
            CREATE_BALANCE_TABLE,
            CREATE_CODE_TABLE,
            CREATE_NONCE_TABLE,
            CREATE_STORAGE_TABLE,
        ] {
            conn.execute(ddl, [])?;
        }

        debug!(path = %path.display(), "opened archive");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Append the update for the given block.
    ///
    /// The block height must be strictly greater than every height already in
    /// the archive. All rows produced by the update become visible atomically
    /// on commit; any failure rolls the whole block back.
    pub fn add(&self, block: u64, update: &Update) -> Result<()> {
        self.with_conn_mut(|conn| {
            let block_db = block_for_insert(block)?;

            if let Some(newest) = last_block_height(conn)? {
                if newest >= block {
                    return Err(Error::NonMonotonicBlock { block, newest });
                }
            }

            // Hash every account diff before touching the database.
            let diffs = update.per_account();

            let tx = conn.transaction()?;

            tx.prepare_cached(ADD_BLOCK)?.execute([block_db])?;

            // Deletes precede creates so a destroy-then-recreate lands on the
            // higher reincarnation.
            for addr in &update.deleted_accounts {
                tx.prepare_cached(DELETE_ACCOUNT)?.execute(params![
                    addr.as_slice(),
                    block_db,
                    addr.as_slice()
                ])?;
            }
            for addr in &update.created_accounts {
                tx.prepare_cached(CREATE_ACCOUNT)?.execute(params![
                    addr.as_slice(),
                    block_db,
                    addr.as_slice()
                ])?;
            }

            for (addr, balance) in &update.balances {
                tx.prepare_cached(ADD_BALANCE)?.execute(params![
                    addr.as_slice(),
                    block_db,
                    balance.to_be_bytes::<16>().as_slice()
                ])?;
            }
            for (addr, code) in &update.codes {
                tx.prepare_cached(ADD_CODE)?
                    .execute(params![addr.as_slice(), block_db, &code[..]])?;
            }
            for (addr, nonce) in &update.nonces {
                tx.prepare_cached(ADD_NONCE)?.execute(params![
                    addr.as_slice(),
                    block_db,
                    nonce.to_be_bytes().as_slice()
                ])?;
            }

            // The address is bound twice: once for the stored column, once
            // inside the reincarnation subquery.
            for (addr, slot, value) in &update.storage {
                tx.prepare_cached(ADD_STORAGE)?.execute(params![
                    addr.as_slice(),
                    addr.as_slice(),
                    block_db,
                    slot.as_slice(),
                    block_db,
                    value.as_slice()
                ])?;
            }

            for (addr, diff) in &diffs {
                // This account has no row at the current block yet, so the
                // lookup yields its chain value from the previous touch.
                let last = account_hash_at(&tx, block_db, addr)?;
                let chained = combine(&last, &diff.hash());
                tx.prepare_cached(ADD_ACCOUNT_HASH)?.execute(params![
                    addr.as_slice(),
                    block_db,
                    chained.as_slice()
                ])?;
            }

            tx.commit()?;
            debug!(block, accounts = diffs.len(), "appended block update");
            Ok(())
        })
    }

    /// Highest block height added so far, `None` on a fresh archive.
    pub fn get_last_block_height(&self) -> Result<Option<u64>> {
        self.with_conn(last_block_height)
    }

    /// Whether the account exists at the given block height. Accounts that
    /// were never touched do not exist.
    pub fn exists(&self, block: u64, account: &Address) -> Result<bool> {
        self.with_conn(|conn| {
            let exist: Option<i64> = conn
                .prepare_cached(GET_STATUS)?
                .query_row(params![account.as_slice(), block_for_query(block)], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(exist.is_some_and(|v| v != 0))
        })
    }

    /// Balance of the account at the given block height; zero if it was
    /// never written.
    pub fn get_balance(&self, block: u64, account: &Address) -> Result<U128> {
        // TODO: once status feeds the read path, reject reads of accounts
        // that do not exist at the queried block.
        self.with_conn(|conn| {
            let bytes: Option<Vec<u8>> = conn
                .prepare_cached(GET_BALANCE)?
                .query_row(params![account.as_slice(), block_for_query(block)], |row| {
                    row.get(0)
                })
                .optional()?;
            match bytes {
                Some(bytes) => read_balance(&bytes),
                None => Ok(U128::ZERO),
            }
        })
    }

    /// Nonce of the account at the given block height; zero if never written.
    pub fn get_nonce(&self, block: u64, account: &Address) -> Result<u64> {
        self.with_conn(|conn| {
            let bytes: Option<Vec<u8>> = conn
                .prepare_cached(GET_NONCE)?
                .query_row(params![account.as_slice(), block_for_query(block)], |row| {
                    row.get(0)
                })
                .optional()?;
            match bytes {
                Some(bytes) => read_nonce(&bytes),
                None => Ok(0),
            }
        })
    }

    /// Code of the account at the given block height; empty if never written.
    pub fn get_code(&self, block: u64, account: &Address) -> Result<Bytes> {
        self.with_conn(|conn| {
            let bytes: Option<Vec<u8>> = conn
                .prepare_cached(GET_CODE)?
                .query_row(params![account.as_slice(), block_for_query(block)], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(bytes.map(Bytes::from).unwrap_or_default())
        })
    }

    /// Value of a storage slot at the given block height; zero if the slot
    /// was not written within the account's current reincarnation.
    pub fn get_storage(&self, block: u64, account: &Address, slot: &B256) -> Result<B256> {
        self.with_conn(|conn| {
            let block_db = block_for_query(block);
            let bytes: Option<Vec<u8>> = conn
                .prepare_cached(GET_STORAGE)?
                .query_row(
                    params![
                        account.as_slice(),
                        account.as_slice(),
                        block_db,
                        slot.as_slice(),
                        block_db
                    ],
                    |row| row.get(0),
                )
                .optional()?;
            match bytes {
                Some(bytes) => read_b256(&bytes, "storage value"),
                None => Ok(B256::ZERO),
            }
        })
    }

    /// Chain value of the account's hash at the given block height. The hash
    /// of an account that was never touched is zero; every touch extends the
    /// chain by combining the previous value with the diff hash.
    pub fn get_account_hash(&self, block: u64, account: &Address) -> Result<B256> {
        self.with_conn(|conn| account_hash_at(conn, block_for_query(block), account))
    }

    /// Archive-wide commitment at the given block height: the digest of every
    /// account's latest chain value, in ascending address order.
    pub fn get_hash(&self, block: u64) -> Result<B256> {
        self.with_conn(|conn| archive_hash(conn, block))
    }

    /// Distinct accounts with recorded history at the given block height, in
    /// ascending address order.
    pub fn get_account_list(&self, block: u64) -> Result<Vec<Address>> {
        self.with_conn(|conn| account_list(conn, block))
    }

    /// Check the full archive against the expected commitment: engine-level
    /// integrity, the archive hash, every account's chain, and the absence of
    /// content rows without hash entries.
    pub fn verify(&self, block: u64, expected_hash: &B256) -> Result<()> {
        self.with_conn(|conn| {
            debug!(block, "verifying archive");
            verify::verify(conn, block, expected_hash)
        })
    }

    /// Re-derive one account's hash chain from its raw rows and compare it
    /// against the recorded chain values.
    pub fn verify_account(&self, block: u64, account: &Address) -> Result<()> {
        self.with_conn(|conn| verify::verify_account(conn, block, account))
    }

    /// Best-effort durability hook: fold the write-ahead log back into the
    /// main database file.
    pub fn flush(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
            Ok(())
        })
    }

    /// Close the archive. Every prepared statement is finalized before the
    /// connection is released; later operations fail with [`Error::Closed`].
    /// Closing an already-closed archive is a no-op.
    pub fn close(&self) -> Result<()> {
        let Some(conn) = self.conn.lock().take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, err)| Error::Db(err))
    }

    /// Advisory memory footprint: the handle itself plus the engine-reported
    /// database size.
    pub fn memory_footprint(&self) -> Result<u64> {
        self.with_conn(|conn| Ok(mem::size_of::<Self>() as u64 + db::database_size(conn)?))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(Error::Closed)?;
        f(conn)
    }

    fn with_conn_mut<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(Error::Closed)?;
        f(conn)
    }
}

fn last_block_height(conn: &Connection) -> Result<Option<u64>> {
    let height = conn
        .prepare_cached(GET_BLOCK_HEIGHT)?
        .query_row([], |row| row.get::<_, u64>(0))
        .optional()?;
    Ok(height)
}

fn account_hash_at(conn: &Connection, block: i64, account: &Address) -> Result<B256> {
    let bytes: Option<Vec<u8>> = conn
        .prepare_cached(GET_ACCOUNT_HASH)?
        .query_row(params![account.as_slice(), block], |row| row.get(0))
        .optional()?;
    match bytes {
        Some(bytes) => read_b256(&bytes, "account hash"),
        None => Ok(B256::ZERO),
    }
}

pub(crate) fn archive_hash(conn: &Connection, block: u64) -> Result<B256> {
    let mut stmt = conn.prepare_cached(GET_ARCHIVE_HASH)?;
    let mut rows = stmt.query([block_for_query(block)])?;
    let mut hasher = Hasher::new();
    while let Some(row) = rows.next()? {
        let hash: Vec<u8> = row.get(0)?;
        hasher.ingest(&hash);
    }
    Ok(hasher.finish())
}

pub(crate) fn account_list(conn: &Connection, block: u64) -> Result<Vec<Address>> {
    let mut stmt = conn.prepare_cached(GET_ACCOUNT_LIST)?;
    let mut rows = stmt.query([block_for_query(block)])?;
    let mut accounts = Vec::new();
    while let Some(row) = rows.next()? {
        let bytes: Vec<u8> = row.get(0)?;
        accounts.push(read_address(&bytes)?);
    }
    Ok(accounts)
}

/// Block heights are stored in a signed 64-bit column; writes must fit.
fn block_for_insert(block: u64) -> Result<i64> {
    i64::try_from(block).map_err(|_| Error::BlockOutOfRange(block))
}

/// Reads clamp to the maximum storable height, which is exact because no
/// larger height can have been inserted.
pub(crate) fn block_for_query(block: u64) -> i64 {
    i64::try_from(block).unwrap_or(i64::MAX)
}

pub(crate) fn read_address(bytes: &[u8]) -> Result<Address> {
    Address::try_from(bytes).map_err(|_| Error::InvalidColumn {
        column: "account",
        expected: Address::len_bytes(),
        got: bytes.len(),
    })
}

pub(crate) fn read_b256(bytes: &[u8], column: &'static str) -> Result<B256> {
    B256::try_from(bytes).map_err(|_| Error::InvalidColumn {
        column,
        expected: B256::len_bytes(),
        got: bytes.len(),
    })
}

pub(crate) fn read_balance(bytes: &[u8]) -> Result<U128> {
    let raw: [u8; 16] = bytes.try_into().map_err(|_| Error::InvalidColumn {
        column: "balance",
        expected: 16,
        got: bytes.len(),
    })?;
    Ok(U128::from_be_bytes(raw))
}

pub(crate) fn read_nonce(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| Error::InvalidColumn {
        column: "nonce",
        expected: 8,
        got: bytes.len(),
    })?;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_for_insert_rejects_heights_above_i64_max() {
        assert!(block_for_insert(u64::MAX).is_err());
        assert_eq!(block_for_insert(i64::MAX as u64).unwrap(), i64::MAX);
        assert_eq!(block_for_insert(0).unwrap(), 0);
    }

    #[test]
    fn block_for_query_clamps_instead_of_failing() {
        assert_eq!(block_for_query(u64::MAX), i64::MAX);
        assert_eq!(block_for_query(7), 7);
    }

    #[test]
    fn column_readers_check_lengths() {
        assert!(read_address(&[0u8; 20]).is_ok());
        assert!(matches!(
            read_address(&[0u8; 19]),
            Err(Error::InvalidColumn { column: "account", expected: 20, got: 19 })
        ));

        assert!(read_b256(&[0u8; 32], "hash").is_ok());
        assert!(read_b256(&[0u8; 31], "hash").is_err());

        assert_eq!(read_balance(&100u128.to_be_bytes()).unwrap(), U128::from(100u64));
        assert!(read_balance(&[0u8; 15]).is_err());

        assert_eq!(read_nonce(&5u64.to_be_bytes()).unwrap(), 5);
        assert!(read_nonce(&[0u8; 7]).is_err());
    }
}
