use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical exchange namespaces carried by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusExchange {
    Events,
    Commands,
    Requests,
    Responses,
    MarketData,
    Dlx,
}

impl BusExchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusExchange::Events => "events",
            BusExchange::Commands => "commands",
            BusExchange::Requests => "requests",
            BusExchange::Responses => "responses",
            BusExchange::MarketData => "market_data",
            BusExchange::Dlx => "dlx",
        }
    }
}

impl fmt::Display for BusExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// AMQP-style topic match: `*` matches exactly one dot-separated segment,
/// `#` matches zero or more.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pat: &[&str], key: &[&str]) -> bool {
        match (pat.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                // '#' swallows zero or more segments.
                matches(&pat[1..], key) || (!key.is_empty() && matches(pat, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pat[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pat[1..], &key[1..]),
            _ => false,
        }
    }
    let pat: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pat, &key)
}

/// Routing key builders. Dotted lowercase hierarchy throughout.
pub mod keys {
    use crate::domain::types::routing_symbol;
    use uuid::Uuid;

    pub const EXECUTE_TRADE: &str = "commands.execute_trade";
    pub const CANCEL_ORDER: &str = "commands.cancel_order";
    pub const RECONCILE: &str = "commands.reconcile";
    pub const TRADE_EXECUTED: &str = "events.trade_executed";
    pub const ERROR: &str = "events.error";

    pub fn market_data(exchange: &str, symbol: &str) -> String {
        format!(
            "market_data.{}.{}",
            exchange.to_ascii_lowercase(),
            routing_symbol(symbol)
        )
    }

    pub fn allocation_request(strategy_id: &str) -> String {
        format!("request.capital.allocation.{}", strategy_id)
    }

    pub fn allocation_response(correlation_id: Uuid) -> String {
        format!("response.capital.allocation.{}", correlation_id)
    }

    pub fn history_request(strategy_id: &str) -> String {
        format!("request.market_data.history.{}", strategy_id)
    }

    pub fn system(event_type: &str) -> String {
        format!("events.system.{}", event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_keys_match_themselves() {
        assert!(topic_matches("commands.execute_trade", "commands.execute_trade"));
        assert!(!topic_matches("commands.execute_trade", "commands.cancel_order"));
    }

    #[test]
    fn star_matches_exactly_one_segment() {
        assert!(topic_matches("market_data.binance.*", "market_data.binance.btcusdt"));
        assert!(!topic_matches("market_data.binance.*", "market_data.binance"));
        assert!(!topic_matches("market_data.*", "market_data.binance.btcusdt"));
    }

    #[test]
    fn hash_matches_zero_or_more() {
        assert!(topic_matches("events.#", "events.trade_executed"));
        assert!(topic_matches("events.#", "events.system.strategy_halted"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("events.#", "events"));
        assert!(!topic_matches("events.#", "commands.execute_trade"));
    }

    #[test]
    fn hash_in_the_middle() {
        assert!(topic_matches("request.#.history", "request.a.b.history"));
        assert!(topic_matches("request.#.history", "request.history"));
        assert!(!topic_matches("request.#.history", "request.a.b"));
    }

    #[test]
    fn market_data_key_shape() {
        assert_eq!(
            keys::market_data("Binance", "BTC/USDT"),
            "market_data.binance.btcusdt"
        );
    }

    #[test]
    fn rpc_and_system_key_shapes() {
        let corr = uuid::Uuid::nil();
        assert_eq!(
            keys::allocation_request("ma-btc"),
            "request.capital.allocation.ma-btc"
        );
        assert_eq!(
            keys::allocation_response(corr),
            format!("response.capital.allocation.{}", corr)
        );
        assert_eq!(
            keys::history_request("ma-btc"),
            "request.market_data.history.ma-btc"
        );
        assert_eq!(keys::system("ws_reconnected"), "events.system.ws_reconnected");
    }
}
