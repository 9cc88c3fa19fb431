/// Protocol guardrails and default tunables.
///
/// These constants bound oplog size, sync bursts and key lifetimes. Values
/// marked "default" are overridable by node configuration.

/// Max `data` size per oplog (article/message blocks travel inline).
pub const MAX_OPLOG_DATA_BYTES: usize = 2 * 1024 * 1024; // 2 MB

/// Max `extra` piggyback per oplog.
pub const MAX_OPLOG_EXTRA_BYTES: usize = 16 * 1024; // 16 KB

/// Max master co-signatures carried on one oplog.
pub const MAX_MASTER_SIGNS: usize = 32;

/// Max bytes per content line.
pub const N_BYTE_IN_BLOCK: usize = 65535;

/// Lines per content block.
pub const N_LINE_IN_BLOCK: usize = 20;

/// Max oplogs returned for one pull or one push frame.
pub const MAX_SYNC_OPLOG_ACK: usize = 200;

/// Default merkle buckets reconciled per sync round.
pub const DEFAULT_MAX_SYNC: usize = 5;

/// Default tolerated clock skew for incoming oplogs, in seconds.
pub const DEFAULT_FUTURE_TOLERANCE_SECS: i64 = 30;

/// Default seconds before an unsigned (pending) oplog is discarded.
pub const DEFAULT_EXPIRE_OPLOG_SECS: i64 = 300;

/// Default OpKey lifetime, in seconds (3 days).
pub const DEFAULT_EXPIRE_OPKEY_SECS: i64 = 259_200;

/// Default seconds before expiry at which an OpKey is renewed (1 day).
pub const DEFAULT_RENEW_OPKEY_SECS: i64 = 86_400;

/// Default join-key renewal period (1 day).
pub const DEFAULT_RENEW_JOIN_KEY_SECS: i64 = 86_400;

/// Default friend sync tick bounds, in seconds.
pub const DEFAULT_MIN_SYNC_RANDOM_SECS: u64 = 15;
pub const DEFAULT_MAX_SYNC_RANDOM_SECS: u64 = 30;

/// Max entries kept in the cross-entity PttOplog feed.
pub const MAX_COUNT_PTT_OPLOG: usize = 2000;

/// Oplog size check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCheck {
    Ok,
    DataTooLarge(usize),
    ExtraTooLarge(usize),
}

/// Check oplog payload sizes against the guardrails.
pub fn check_oplog_size(data_len: usize, extra_len: usize) -> SizeCheck {
    if data_len > MAX_OPLOG_DATA_BYTES {
        SizeCheck::DataTooLarge(data_len)
    } else if extra_len > MAX_OPLOG_EXTRA_BYTES {
        SizeCheck::ExtraTooLarge(extra_len)
    } else {
        SizeCheck::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_ok() {
        assert_eq!(check_oplog_size(0, 0), SizeCheck::Ok);
        assert_eq!(check_oplog_size(MAX_OPLOG_DATA_BYTES, MAX_OPLOG_EXTRA_BYTES), SizeCheck::Ok);
    }

    #[test]
    fn test_size_too_large() {
        assert_eq!(
            check_oplog_size(MAX_OPLOG_DATA_BYTES + 1, 0),
            SizeCheck::DataTooLarge(MAX_OPLOG_DATA_BYTES + 1)
        );
        assert_eq!(
            check_oplog_size(1, MAX_OPLOG_EXTRA_BYTES + 1),
            SizeCheck::ExtraTooLarge(MAX_OPLOG_EXTRA_BYTES + 1)
        );
    }
}
