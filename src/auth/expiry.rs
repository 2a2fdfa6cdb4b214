// Access token expiry policy

use chrono::{DateTime, Duration, Utc};

/// Whether the access token must be treated as expired.
///
/// A missing expiry counts as expired.
pub fn is_expired(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    is_expired_with_leeway(expiry, now, Duration::zero())
}

/// Like [`is_expired`], but the token is considered expired `leeway` early
pub fn is_expired_with_leeway(
    expiry: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    leeway: Duration,
) -> bool {
    match expiry {
        None => true,
        Some(exp) => now + leeway >= exp,
    }
}

/// Expiry for a token issued at `now` with the given lifetime.
/// Truncated to whole milliseconds, the precision the store persists.
pub fn expiry_after(now: DateTime<Utc>, lifetime: Duration) -> DateTime<Utc> {
    let expiry = now + lifetime;
    DateTime::from_timestamp_millis(expiry.timestamp_millis()).unwrap_or(expiry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_expiry_after_truncates_to_millis() {
        let now = DateTime::from_timestamp(1_736_677_800, 123_456_789).unwrap();
        let expiry = expiry_after(now, Duration::hours(1));
        assert_eq!(expiry.timestamp_millis(), 1_736_681_400_123);
        assert_eq!(expiry.timestamp_subsec_nanos(), 123_000_000);
    }

    #[test]
    fn test_missing_expiry_is_expired() {
        assert!(is_expired(None, Utc::now()));
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        assert!(is_expired(Some(now), now));
        assert!(is_expired(Some(now - Duration::seconds(1)), now));
        assert!(!is_expired(Some(now + Duration::seconds(1)), now));
    }

    #[test]
    fn test_leeway_expires_early() {
        let now = Utc::now();
        let expiry = Some(now + Duration::seconds(120));

        assert!(!is_expired_with_leeway(expiry, now, Duration::seconds(60)));
        assert!(is_expired_with_leeway(expiry, now, Duration::seconds(120)));
        assert!(is_expired_with_leeway(expiry, now, Duration::seconds(300)));
    }

    proptest! {
        #[test]
        fn expired_iff_now_not_before_expiry(now_ms in 0i64..4_000_000_000_000, offset_ms in -10_000_000i64..10_000_000) {
            let now = DateTime::from_timestamp_millis(now_ms).unwrap();
            let expiry = now + Duration::milliseconds(offset_ms);
            prop_assert_eq!(is_expired(Some(expiry), now), offset_ms <= 0);
        }

        #[test]
        fn leeway_never_makes_a_token_fresher(now_ms in 0i64..4_000_000_000_000, offset_ms in -10_000_000i64..10_000_000, leeway_s in 0i64..3600) {
            let now = DateTime::from_timestamp_millis(now_ms).unwrap();
            let expiry = Some(now + Duration::milliseconds(offset_ms));
            if is_expired(expiry, now) {
                prop_assert!(is_expired_with_leeway(expiry, now, Duration::seconds(leeway_s)));
            }
        }
    }
}
