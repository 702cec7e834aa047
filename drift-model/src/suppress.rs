//! Per-file rate limiting of rescan acceptance.
//!
//! A file that is rewritten continuously (a log, a database file being
//! checkpointed) would otherwise be rehashed and re-announced on every scan,
//! keeping the whole cluster busy moving bytes nobody can use. The walker
//! consults this filter before admitting a rehash; a suppressed file is
//! announced as invalid instead so peers stop trying to pull it.

use std::time::Duration;

/// Never admit changes to the same file more often than this.
pub(crate) const MIN_FILE_HOLD: Duration = Duration::from_secs(60);

/// Always admit a change once this much time has passed.
pub(crate) const MAX_FILE_HOLD: Duration = Duration::from_secs(600);

/// The suppression law.
///
/// `since_last` is the time since the last admitted change (`None` when the
/// file has never been admitted), `suppressed` the count of consecutive
/// suppressions since then. The first change is always admitted; rapid
/// follow-ups are held for at least `2 * MIN_FILE_HOLD`, each further
/// suppression extends the hold by `MIN_FILE_HOLD`, and `MAX_FILE_HOLD` caps
/// the total hold regardless of the count.
pub(crate) fn should_suppress(since_last: Option<Duration>, suppressed: u32) -> bool {
    let Some(since) = since_last else {
        return false;
    };
    if since > MAX_FILE_HOLD {
        return false;
    }
    since < MIN_FILE_HOLD * (suppressed + 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Option<Duration> {
        Some(Duration::from_secs(s))
    }

    #[test]
    fn suppression_law() {
        let cases = [
            (None, 0, false),     // first change
            (secs(1), 0, true),   // changed one second ago
            (secs(119), 0, true), // changed 119 s ago
            (secs(121), 0, false),
            (secs(179), 1, true), // suppressed once, 179 s ago
            (secs(181), 1, false),
            (secs(599), 99, true), // heavily suppressed, max hold nearly over
            (secs(601), 99, false),
        ];
        for (since, count, expected) in cases {
            assert_eq!(
                should_suppress(since, count),
                expected,
                "since={since:?} count={count}"
            );
        }
    }
}
