//! Shared wire vocabulary for the Polygon market-data proxy stack.
//!
//! Three standalone services (`firehose-proxy`, `ms-aggregator`,
//! `filtered-proxy`) speak a common control-frame protocol and a common
//! upstream message shape. This crate is the single place that protocol
//! is parsed and matched, so each binary does exactly one parse per
//! upstream frame instead of re-deriving ad-hoc field lookups.

pub mod backoff;
pub mod control;
pub mod hours;
pub mod message;
pub mod metrics;
pub mod selector;

pub use backoff::ReconnectBackoff;
pub use control::{ControlAction, ControlRequest, StatusFrame, StatusMessage};
pub use hours::is_regular_session;
pub use message::{Bar, MinuteAgg, PolygonMessage, Quote, SecondAgg, Trade};
pub use metrics::{DropReason, Metrics, MetricsSnapshot};
pub use selector::{parse_selectors, Channel, ChannelSelector, Selector, SymbolSelector, WireError};

/// Normalize a raw symbol string the way the DATA MODEL section requires:
/// uppercase, trimmed, with the literal wildcard passed through unchanged.
pub fn normalize_symbol(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed == "*" {
        "*".to_string()
    } else {
        trimmed.to_ascii_uppercase()
    }
}
