use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::selector::Channel;

/// A single upstream (or synthetic) market-data event. The `ev` discriminant
/// Polygon and the aggregator both emit isn't a fixed enumeration of
/// literals — bar channels are `"<N>Ms"` for any `N` — so this can't be a
/// plain `#[serde(tag = "ev")]` enum. Deserialization instead peeks `ev` as
/// a string and dispatches by prefix/suffix. Unrecognized `ev` values (or
/// control-channel noise that slips into a data array) land in `Other`
/// rather than failing the whole batch.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum PolygonMessage {
    Trade(Trade),
    Quote(Quote),
    SecondAgg(SecondAgg),
    MinuteAgg(MinuteAgg),
    Bar(Bar),
    Status(crate::control::StatusMessage),
    Other(Value),
}

impl<'de> Deserialize<'de> for PolygonMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let ev = value.get("ev").and_then(Value::as_str).map(str::to_string);

        let decoded = match ev.as_deref() {
            Some("T") => serde_json::from_value(value.clone()).ok().map(PolygonMessage::Trade),
            Some("Q") => serde_json::from_value(value.clone()).ok().map(PolygonMessage::Quote),
            Some("A") => serde_json::from_value(value.clone()).ok().map(PolygonMessage::SecondAgg),
            Some("AM") => serde_json::from_value(value.clone()).ok().map(PolygonMessage::MinuteAgg),
            Some("status") => serde_json::from_value(value.clone()).ok().map(PolygonMessage::Status),
            Some(tag) if tag.ends_with("Ms") && Channel::parse(tag).is_some() => {
                let interval_ms = match Channel::parse(tag) {
                    Some(Channel::MsBar(n)) => n,
                    _ => unreachable!("guarded above"),
                };
                serde_json::from_value::<Bar>(value.clone()).ok().map(|mut b| {
                    b.interval_ms = interval_ms;
                    PolygonMessage::Bar(b)
                })
            }
            _ => None,
        };

        Ok(decoded.unwrap_or(PolygonMessage::Other(value)))
    }
}

impl PolygonMessage {
    pub fn symbol(&self) -> Option<&str> {
        match self {
            PolygonMessage::Trade(t) => Some(&t.symbol),
            PolygonMessage::Quote(q) => Some(&q.symbol),
            PolygonMessage::SecondAgg(a) => Some(&a.symbol),
            PolygonMessage::MinuteAgg(a) => Some(&a.symbol),
            PolygonMessage::Bar(b) => Some(&b.symbol),
            PolygonMessage::Status(_) | PolygonMessage::Other(_) => None,
        }
    }

    pub fn channel(&self) -> Option<Channel> {
        match self {
            PolygonMessage::Trade(_) => Some(Channel::Trade),
            PolygonMessage::Quote(_) => Some(Channel::Quote),
            PolygonMessage::SecondAgg(_) => Some(Channel::SecondAgg),
            PolygonMessage::MinuteAgg(_) => Some(Channel::MinuteAgg),
            PolygonMessage::Bar(b) => Some(Channel::MsBar(b.interval_ms)),
            PolygonMessage::Status(_) | PolygonMessage::Other(_) => None,
        }
    }

    pub fn timestamp_ms(&self) -> Option<i64> {
        match self {
            PolygonMessage::Trade(t) => Some(t.timestamp),
            PolygonMessage::Quote(q) => Some(q.timestamp),
            PolygonMessage::SecondAgg(a) => Some(a.end_timestamp),
            PolygonMessage::MinuteAgg(a) => Some(a.end_timestamp),
            PolygonMessage::Bar(b) => Some(b.end_timestamp),
            PolygonMessage::Status(_) | PolygonMessage::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    #[serde(rename = "sym")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: f64,
    #[serde(rename = "s")]
    pub size: f64,
    #[serde(rename = "t")]
    pub timestamp: i64,
    #[serde(flatten)]
    pub extra: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quote {
    #[serde(rename = "sym")]
    pub symbol: String,
    #[serde(rename = "bp")]
    pub bid_price: f64,
    #[serde(rename = "bs")]
    pub bid_size: f64,
    #[serde(rename = "ap")]
    pub ask_price: f64,
    #[serde(rename = "as")]
    pub ask_size: f64,
    #[serde(rename = "t")]
    pub timestamp: i64,
    #[serde(flatten)]
    pub extra: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecondAgg {
    #[serde(rename = "sym")]
    pub symbol: String,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: f64,
    #[serde(rename = "s")]
    pub start_timestamp: i64,
    #[serde(rename = "e")]
    pub end_timestamp: i64,
    #[serde(flatten)]
    pub extra: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MinuteAgg {
    #[serde(rename = "sym")]
    pub symbol: String,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: f64,
    #[serde(rename = "s")]
    pub start_timestamp: i64,
    #[serde(rename = "e")]
    pub end_timestamp: i64,
    #[serde(flatten)]
    pub extra: Value,
}

/// A synthesized millisecond bar, the one event type this stack originates
/// rather than relays. The `ev` tag is the interval-specific channel name
/// (`"500Ms"`, `"250Ms"`, ...) so it round-trips through `Channel::parse`
/// the same way a client-supplied selector does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub ev: String,
    #[serde(rename = "sym")]
    pub symbol: String,
    #[serde(skip)]
    pub interval_ms: u64,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: f64,
    #[serde(rename = "n")]
    pub trade_count: u64,
    #[serde(rename = "s")]
    pub start_timestamp: i64,
    #[serde(rename = "e")]
    pub end_timestamp: i64,
}

impl Bar {
    pub fn new(
        interval_ms: u64,
        symbol: impl Into<String>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        trade_count: u64,
        start_timestamp: i64,
        end_timestamp: i64,
    ) -> Self {
        Bar {
            ev: format!("{interval_ms}Ms"),
            symbol: symbol.into(),
            interval_ms,
            open,
            high,
            low,
            close,
            volume,
            trade_count,
            start_timestamp,
            end_timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_round_trips_with_extra_fields() {
        let raw = serde_json::json!({
            "ev": "T",
            "sym": "TSLA",
            "p": 245.12,
            "s": 10.0,
            "t": 1_700_000_000_000_i64,
            "c": [0, 12],
            "x": 4
        });
        let msg: PolygonMessage = serde_json::from_value(raw).unwrap();
        match &msg {
            PolygonMessage::Trade(t) => {
                assert_eq!(t.symbol, "TSLA");
                assert_eq!(t.price, 245.12);
                assert!(t.extra.get("x").is_some());
            }
            other => panic!("expected trade, got {other:?}"),
        }
        assert_eq!(msg.symbol(), Some("TSLA"));
    }

    #[test]
    fn bar_ev_tag_matches_interval() {
        let bar = Bar::new(500, "TSLA", 1.0, 2.0, 0.5, 1.5, 100.0, 4, 0, 500);
        let value = serde_json::to_value(&bar).unwrap();
        assert_eq!(value["ev"], "500Ms");
        assert_eq!(value["sym"], "TSLA");
    }

    #[test]
    fn unrecognized_event_falls_back_to_other() {
        let raw = serde_json::json!({"ev": "LULD", "sym": "AAPL"});
        let msg: PolygonMessage = serde_json::from_value(raw).unwrap();
        assert!(matches!(msg, PolygonMessage::Other(_)));
    }
}
