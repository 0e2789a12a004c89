//! Wire-level field conventions.
//!
//! Document staging metadata lives under the `txn` xattr namespace; ATR
//! entries live under `attempts.<attemptId>` in the ATR document's xattrs.
//! These paths are protocol constants shared with other client
//! implementations; changing one breaks interoperability.

/// Root of a document's transaction xattrs.
pub const TXN_PREFIX: &str = "txn";

/// Transaction id owning the staging metadata.
pub const TXN_ID: &str = "txn.id";

/// Id of the ATR document coordinating this document's attempt.
pub const TXN_ATR_ID: &str = "txn.atr_id";

/// Bucket the ATR document lives in.
pub const TXN_ATR_BUCKET: &str = "txn.atr_bkt";

/// Scope the ATR document lives in.
pub const TXN_ATR_SCOPE: &str = "txn.atr_scp";

/// Collection the ATR document lives in.
pub const TXN_ATR_COLLECTION: &str = "txn.atr_coll";

/// Staging version: the attempt id that owns the staged write.
pub const TXN_STAGED_VERSION: &str = "txn.ver";

/// The staged content itself (or the removal sentinel).
pub const TXN_STAGED_DATA: &str = "txn.staged";

/// Document value checksum recorded at staging time (macro-expanded).
pub const TXN_CRC32: &str = "txn.crc32";

/// Staged-content sentinel marking a staged removal.
pub const REMOVED_SENTINEL: &str = "<<REMOVED>>";

/// Map of attempt-id to attempt entry inside an ATR document.
pub const ATR_FIELD_ATTEMPTS: &str = "attempts";

/// Attempt state (`"PENDING"`, `"COMMITTED"`, ...).
pub const ATR_FIELD_STATUS: &str = "st";

/// Start timestamp, macro-expanded from the mutation's own CAS.
pub const ATR_FIELD_START_TIMESTAMP: &str = "tst";

/// Commit timestamp, macro-expanded from the mutation's own CAS.
pub const ATR_FIELD_COMMIT_TIMESTAMP: &str = "tsc";

/// Rollback-start timestamp, macro-expanded from the mutation's own CAS.
pub const ATR_FIELD_ROLLBACK_START_TIMESTAMP: &str = "rbs";

/// Attempt expiry, in milliseconds from the start timestamp.
pub const ATR_FIELD_EXPIRES_AFTER_MSECS: &str = "exp";

/// Transaction id the attempt belongs to.
pub const ATR_FIELD_TRANSACTION_ID: &str = "tid";

/// Durability level the attempt ran with (short encoding).
pub const ATR_FIELD_DURABILITY: &str = "d";

/// Transient sentinel inserted while removing a PENDING entry, fencing the
/// attempt's own concurrent completion.
pub const ATR_FIELD_PENDING_SENTINEL: &str = "p";

/// Documents staged as inserts, recorded at the commit/abort decision.
pub const ATR_FIELD_DOCS_INSERTED: &str = "ins";

/// Documents staged as replaces, recorded at the commit/abort decision.
pub const ATR_FIELD_DOCS_REPLACED: &str = "rep";

/// Documents staged as removes, recorded at the commit/abort decision.
pub const ATR_FIELD_DOCS_REMOVED: &str = "rem";

/// Number of ATR documents transaction ids shard across.
pub const NUM_ATRS: u32 = 1024;

/// Returns the prefixed path of one attempt's entry: `attempts.<id>`.
#[must_use]
pub fn atr_entry_root(attempt_id: &str) -> String {
    format!("{ATR_FIELD_ATTEMPTS}.{attempt_id}")
}

/// Deterministically shards a document key onto one of the [`NUM_ATRS`]
/// ATR documents. Every client must agree on this mapping, so it hashes
/// the raw key bytes with CRC32-C.
#[must_use]
pub fn atr_id_for_key(key: &str) -> String {
    let shard = crc32c::crc32c(key.as_bytes()) % NUM_ATRS;
    format!("_txn:atr-{shard}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atr_sharding_is_deterministic() {
        assert_eq!(atr_id_for_key("order::17"), atr_id_for_key("order::17"));
    }

    #[test]
    fn atr_sharding_stays_in_range() {
        for key in ["a", "b", "order::17", "user::42", ""] {
            let id = atr_id_for_key(key);
            let shard: u32 = id.strip_prefix("_txn:atr-").unwrap().parse().unwrap();
            assert!(shard < NUM_ATRS);
        }
    }

    #[test]
    fn atr_entry_root_is_prefixed() {
        assert_eq!(atr_entry_root("a-1"), "attempts.a-1");
    }
}
