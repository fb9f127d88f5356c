use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Deterministic identity of a trading intent. Two proposals with the same
/// fingerprint are the same intent; the worker and the Capital Manager both
/// dedupe on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// `sha256(strategy_id | symbol | intent_tag | bar_close_ts_ms)`,
    /// truncated to 16 hex characters.
    pub fn compute(
        strategy_id: &str,
        symbol: &str,
        intent_tag: &str,
        bar_close_ts: DateTime<Utc>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(strategy_id.as_bytes());
        hasher.update(b"|");
        hasher.update(symbol.as_bytes());
        hasher.update(b"|");
        hasher.update(intent_tag.as_bytes());
        hasher.update(b"|");
        hasher.update(bar_close_ts.timestamp_millis().to_be_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_same_fingerprint() {
        let ts = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let a = Fingerprint::compute("s1", "BTC/USDT", "ma_cross_long", ts);
        let b = Fingerprint::compute("s1", "BTC/USDT", "ma_cross_long", ts);
        assert_eq!(a, b);
    }

    #[test]
    fn any_field_changes_the_fingerprint() {
        let ts = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let base = Fingerprint::compute("s1", "BTC/USDT", "ma_cross_long", ts);
        assert_ne!(base, Fingerprint::compute("s2", "BTC/USDT", "ma_cross_long", ts));
        assert_ne!(base, Fingerprint::compute("s1", "ETH/USDT", "ma_cross_long", ts));
        assert_ne!(base, Fingerprint::compute("s1", "BTC/USDT", "ma_cross_short", ts));
        let later = DateTime::from_timestamp_millis(1_700_000_060_000).unwrap();
        assert_ne!(base, Fingerprint::compute("s1", "BTC/USDT", "ma_cross_long", later));
    }

    #[test]
    fn fingerprint_is_16_hex_chars() {
        let fp = Fingerprint::compute("s1", "BTC/USDT", "x", Utc::now());
        assert_eq!(fp.as_str().len(), 16);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
