//! Re-derivation of archive commitments from raw rows.
//!
//! Verification trusts nothing but the stored tables: it replays every
//! account's history in block order, recomputes the hash chain from the
//! canonical diff encoding and compares it against the recorded values.

use rusqlite::{params, Connection, OptionalExtension};

use state_archive_common::{combine, AccountUpdate, Address, Bytes, B256, U128};

use crate::{
    account_list, archive_hash, block_for_query, db, read_b256, read_balance, read_nonce, Error,
    Result,
};

const LIST_HASHES: &str =
    "SELECT block, hash FROM account_hash WHERE account = ? AND block <= ? ORDER BY block";

const LIST_STATUS: &str =
    "SELECT block, exist FROM status WHERE account = ? AND block <= ? ORDER BY block";

const LIST_BALANCES: &str =
    "SELECT block, value FROM balance WHERE account = ? AND block <= ? ORDER BY block";

const LIST_NONCES: &str =
    "SELECT block, value FROM nonce WHERE account = ? AND block <= ? ORDER BY block";

const LIST_CODES: &str =
    "SELECT block, code FROM code WHERE account = ? AND block <= ? ORDER BY block";

const LIST_STORAGE: &str = "SELECT block, slot, value FROM storage WHERE account = ? \
    AND block <= ? ORDER BY block, slot";

const CONTENT_TABLES: [&str; 5] = ["status", "balance", "nonce", "code", "storage"];

/// Full integrity check at the given block height, against the expected
/// archive hash.
pub(crate) fn verify(conn: &Connection, block: u64, expected_hash: &B256) -> Result<()> {
    let issues = db::integrity_check(conn)?;
    if !issues.is_empty() {
        return Err(Error::Corrupted {
            issues: issues.join("\n"),
        });
    }

    if archive_hash(conn, block)? != *expected_hash {
        return Err(Error::ArchiveHashMismatch { block });
    }

    for account in account_list(conn, block)? {
        verify_account(conn, block, &account)?;
    }

    // Content rows whose account never entered the hash table are data the
    // archive has not committed to.
    let block_db = block_for_query(block);
    for table in CONTENT_TABLES {
        let sql = format!(
            "SELECT 1 FROM (SELECT account FROM {table} WHERE block <= ? \
             EXCEPT SELECT account FROM account_hash WHERE block <= ?) LIMIT 1"
        );
        let found = conn
            .prepare(&sql)?
            .query_row(params![block_db, block_db], |_| Ok(()))
            .optional()?;
        if found.is_some() {
            return Err(Error::ExtraRows { table });
        }
    }

    Ok(())
}

/// Replay one account's history up to the given block height and check every
/// recorded chain value.
pub(crate) fn verify_account(conn: &Connection, block: u64, account: &Address) -> Result<()> {
    let rows = AccountRows::load(conn, block, account)?;
    let mut at = RowCursors::default();
    let mut chain = B256::ZERO;

    loop {
        // The next touched block is the lowest head across the data lists.
        let next = [
            rows.status.get(at.status).map(|r| r.0),
            rows.balances.get(at.balance).map(|r| r.0),
            rows.nonces.get(at.nonce).map(|r| r.0),
            rows.codes.get(at.code).map(|r| r.0),
            rows.storage.get(at.storage).map(|r| r.0),
        ]
        .into_iter()
        .flatten()
        .min();
        let Some(current) = next else {
            break;
        };

        let update = rows.rebuild_update(&mut at, current, account)?;

        let Some((hash_block, stored)) = rows.hashes.get(at.hash) else {
            return Err(Error::MissingHash {
                account: *account,
                block: current,
            });
        };
        if *hash_block != current {
            return Err(Error::MissingHash {
                account: *account,
                block: current,
            });
        }
        at.hash += 1;

        chain = combine(&chain, &update.hash());
        if chain != *stored {
            return Err(Error::AccountHashMismatch {
                account: *account,
                block: current,
            });
        }
    }

    // Leftover chain entries commit to updates that are not in the tables.
    if let Some((dangling, _)) = rows.hashes.get(at.hash) {
        return Err(Error::DanglingHash {
            account: *account,
            block: *dangling,
        });
    }

    Ok(())
}

/// One account's complete history up to a block, each list ascending by
/// block (storage additionally by slot).
struct AccountRows {
    hashes: Vec<(u64, B256)>,
    status: Vec<(u64, bool)>,
    balances: Vec<(u64, U128)>,
    nonces: Vec<(u64, u64)>,
    codes: Vec<(u64, Bytes)>,
    storage: Vec<(u64, B256, B256)>,
}

/// Walk positions into the lists of [`AccountRows`].
#[derive(Default)]
struct RowCursors {
    hash: usize,
    status: usize,
    balance: usize,
    nonce: usize,
    code: usize,
    storage: usize,
}

impl AccountRows {
    fn load(conn: &Connection, block: u64, account: &Address) -> Result<Self> {
        let block_db = block_for_query(block);
        let key = account.as_slice();

        let hashes = collect_rows(conn, LIST_HASHES, key, block_db)?
            .into_iter()
            .map(|(b, bytes)| Ok((b, read_b256(&bytes, "account hash")?)))
            .collect::<Result<_>>()?;

        let status = {
            let mut stmt = conn.prepare_cached(LIST_STATUS)?;
            let rows = stmt.query_map(params![key, block_db], |row| {
                Ok((row.get::<_, u64>(0)?, row.get::<_, i64>(1)? != 0))
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let balances = collect_rows(conn, LIST_BALANCES, key, block_db)?
            .into_iter()
            .map(|(b, bytes)| Ok((b, read_balance(&bytes)?)))
            .collect::<Result<_>>()?;

        let nonces = collect_rows(conn, LIST_NONCES, key, block_db)?
            .into_iter()
            .map(|(b, bytes)| Ok((b, read_nonce(&bytes)?)))
            .collect::<Result<_>>()?;

        let codes = collect_rows(conn, LIST_CODES, key, block_db)?
            .into_iter()
            .map(|(b, bytes)| Ok((b, Bytes::from(bytes))))
            .collect::<Result<_>>()?;

        let storage = {
            let mut stmt = conn.prepare_cached(LIST_STORAGE)?;
            let raw: Vec<(u64, Vec<u8>, Vec<u8>)> = stmt
                .query_map(params![key, block_db], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<std::result::Result<_, _>>()?;
            raw.into_iter()
                .map(|(b, slot, value)| {
                    Ok((
                        b,
                        read_b256(&slot, "storage slot")?,
                        read_b256(&value, "storage value")?,
                    ))
                })
                .collect::<Result<Vec<_>>>()?
        };

        Ok(Self {
            hashes,
            status,
            balances,
            nonces,
            codes,
            storage,
        })
    }

    /// Reassemble the account's diff at `current`, advancing every cursor
    /// whose head sits on that block. A second head on the same block means
    /// the table holds duplicate information for one block.
    fn rebuild_update(
        &self,
        at: &mut RowCursors,
        current: u64,
        account: &Address,
    ) -> Result<AccountUpdate> {
        let duplicate = |block| Error::DuplicateUpdate {
            account: *account,
            block,
        };

        let mut update = AccountUpdate::default();

        if let Some((b, exist)) = self.status.get(at.status) {
            if *b == current {
                if *exist {
                    update.created = true;
                } else {
                    update.deleted = true;
                }
                at.status += 1;
                if self.status.get(at.status).is_some_and(|r| r.0 == current) {
                    return Err(duplicate(current));
                }
            }
        }

        if let Some((b, balance)) = self.balances.get(at.balance) {
            if *b == current {
                update.balance = Some(*balance);
                at.balance += 1;
                if self.balances.get(at.balance).is_some_and(|r| r.0 == current) {
                    return Err(duplicate(current));
                }
            }
        }

        if let Some((b, nonce)) = self.nonces.get(at.nonce) {
            if *b == current {
                update.nonce = Some(*nonce);
                at.nonce += 1;
                if self.nonces.get(at.nonce).is_some_and(|r| r.0 == current) {
                    return Err(duplicate(current));
                }
            }
        }

        if let Some((b, code)) = self.codes.get(at.code) {
            if *b == current {
                update.code = Some(code.clone());
                at.code += 1;
                if self.codes.get(at.code).is_some_and(|r| r.0 == current) {
                    return Err(duplicate(current));
                }
            }
        }

        while let Some((b, slot, value)) = self.storage.get(at.storage) {
            if *b != current {
                break;
            }
            if update.storage.last().is_some_and(|(s, _)| s == slot) {
                return Err(duplicate(current));
            }
            update.storage.push((*slot, *value));
            at.storage += 1;
        }

        Ok(update)
    }
}

fn collect_rows(
    conn: &Connection,
    sql: &str,
    account: &[u8],
    block: i64,
) -> Result<Vec<(u64, Vec<u8>)>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params![account, block], |row| {
        Ok((row.get::<_, u64>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}
