use std::fmt;

use thiserror::Error;

use crate::normalize_symbol;

/// A recognized event-family tag. `T`, `Q`, `A` and `AM` come straight from
/// Polygon; `MsBar(n)` is the synthetic family the ms-aggregator produces,
/// tagged `<n>Ms` on the wire (e.g. `500Ms`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Trade,
    Quote,
    SecondAgg,
    MinuteAgg,
    MsBar(u64),
}

impl Channel {
    /// Parse a channel tag as it appears on the wire (`"T"`, `"AM"`, `"500Ms"`, ...).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "T" => Some(Channel::Trade),
            "Q" => Some(Channel::Quote),
            "A" => Some(Channel::SecondAgg),
            "AM" => Some(Channel::MinuteAgg),
            other => {
                let digits = other.strip_suffix("Ms")?;
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                // No leading zero other than a bare "0", which is invalid anyway (n >= 1).
                if digits.len() > 1 && digits.starts_with('0') {
                    return None;
                }
                let n: u64 = digits.parse().ok()?;
                if n == 0 {
                    return None;
                }
                Some(Channel::MsBar(n))
            }
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Trade => write!(f, "T"),
            Channel::Quote => write!(f, "Q"),
            Channel::SecondAgg => write!(f, "A"),
            Channel::MinuteAgg => write!(f, "AM"),
            Channel::MsBar(n) => write!(f, "{n}Ms"),
        }
    }
}

/// One coordinate of a selector: either a concrete channel or the wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelSelector {
    Wildcard,
    Concrete(Channel),
}

impl ChannelSelector {
    fn matches(&self, channel: Channel) -> bool {
        match self {
            ChannelSelector::Wildcard => true,
            ChannelSelector::Concrete(c) => *c == channel,
        }
    }
}

/// The other coordinate of a selector: a concrete, normalized symbol or the wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymbolSelector {
    Wildcard,
    Concrete(String),
}

impl SymbolSelector {
    fn matches(&self, symbol: &str) -> bool {
        match self {
            SymbolSelector::Wildcard => true,
            SymbolSelector::Concrete(s) => s == symbol,
        }
    }
}

/// A `(channel, symbol)` subscription entry. Set semantics: two selectors
/// that parse to the same `(ChannelSelector, SymbolSelector)` pair are the
/// same selector regardless of how they were spelled on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector {
    pub channel: ChannelSelector,
    pub symbol: SymbolSelector,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("empty selector")]
    EmptySelector,
    #[error("invalid selector syntax: {0:?}")]
    InvalidSyntax(String),
    #[error("invalid channel tag: {0:?}")]
    InvalidChannel(String),
    #[error("invalid symbol: {0:?}")]
    InvalidSymbol(String),
}

impl Selector {
    /// Parse one selector. Accepts the grammar from the wire-format section
    /// (`<channel>.<symbol>`) plus the bare wildcard shorthand `"*"`, which
    /// Polygon-compatible clients use to mean "every channel, every symbol".
    pub fn parse(raw: &str) -> Result<Self, WireError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(WireError::EmptySelector);
        }
        if trimmed == "*" {
            return Ok(Selector {
                channel: ChannelSelector::Wildcard,
                symbol: SymbolSelector::Wildcard,
            });
        }

        let (channel_part, symbol_part) = trimmed
            .split_once('.')
            .ok_or_else(|| WireError::InvalidSyntax(trimmed.to_string()))?;

        let channel = if channel_part == "*" {
            ChannelSelector::Wildcard
        } else {
            let c = Channel::parse(channel_part)
                .ok_or_else(|| WireError::InvalidChannel(channel_part.to_string()))?;
            ChannelSelector::Concrete(c)
        };

        let symbol = if symbol_part == "*" {
            SymbolSelector::Wildcard
        } else {
            validate_symbol(symbol_part)
                .ok_or_else(|| WireError::InvalidSymbol(symbol_part.to_string()))?;
            SymbolSelector::Concrete(normalize_symbol(symbol_part))
        };

        Ok(Selector { channel, symbol })
    }

    pub fn matches(&self, channel: Channel, symbol: &str) -> bool {
        self.channel.matches(channel) && self.symbol.matches(symbol)
    }

    /// Does this selector name the synthetic millisecond-bar family?
    pub fn is_ms_bar(&self) -> bool {
        matches!(self.channel, ChannelSelector::Concrete(Channel::MsBar(_)))
    }
}

/// `<symbol> := "*" | [A-Z][A-Z0-9.-]{0,15}` — case-insensitive on input.
fn validate_symbol(raw: &str) -> Option<()> {
    if raw.is_empty() || raw.len() > 16 {
        return None;
    }
    let mut chars = raw.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-') {
        Some(())
    } else {
        None
    }
}

/// Parse a comma-joined list of selectors, trimming whitespace per entry.
/// Invalid entries are collected into the error rather than aborting the
/// whole batch, mirroring the "downstream protocol error, session
/// retained" semantics of the control-frame handlers.
pub fn parse_selectors(params: &str) -> Result<Vec<Selector>, Vec<(String, WireError)>> {
    let mut selectors = Vec::new();
    let mut errors = Vec::new();

    for part in params.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match Selector::parse(part) {
            Ok(s) => selectors.push(s),
            Err(e) => errors.push((part.to_string(), e)),
        }
    }

    if errors.is_empty() {
        Ok(selectors)
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_concrete_selector() {
        let s = Selector::parse("T.TSLA").unwrap();
        assert_eq!(s.channel, ChannelSelector::Concrete(Channel::Trade));
        assert_eq!(s.symbol, SymbolSelector::Concrete("TSLA".to_string()));
    }

    #[test]
    fn parses_ms_bar_channel() {
        let s = Selector::parse("500Ms.TSLA").unwrap();
        assert_eq!(s.channel, ChannelSelector::Concrete(Channel::MsBar(500)));
        assert!(s.is_ms_bar());
    }

    #[test]
    fn parses_wildcards() {
        let s = Selector::parse("*").unwrap();
        assert!(s.matches(Channel::Trade, "AAPL"));
        assert!(s.matches(Channel::MsBar(250), "GOOGL"));

        let s2 = Selector::parse("T.*").unwrap();
        assert!(s2.matches(Channel::Trade, "ANY"));
        assert!(!s2.matches(Channel::Quote, "ANY"));

        let s3 = Selector::parse("*.TSLA").unwrap();
        assert!(s3.matches(Channel::Trade, "TSLA"));
        assert!(!s3.matches(Channel::Trade, "AAPL"));
    }

    #[test]
    fn normalizes_symbol_case() {
        let s = Selector::parse("t.tsla");
        // channel tag itself is case-sensitive per grammar ("T" not "t")
        assert!(s.is_err());

        let s = Selector::parse("T.tsla").unwrap();
        assert_eq!(s.symbol, SymbolSelector::Concrete("TSLA".to_string()));
    }

    #[test]
    fn rejects_invalid_channel_and_symbol() {
        assert!(Selector::parse("X.TSLA").is_err());
        assert!(Selector::parse("0Ms.TSLA").is_err());
        assert!(Selector::parse("T.").is_err());
        assert!(Selector::parse("T").is_err());
        assert!(Selector::parse("").is_err());
    }

    #[test]
    fn parse_selectors_collects_errors_without_aborting() {
        let result = parse_selectors("T.AAPL, X.BAD, Q.MSFT");
        let errors = result.unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "X.BAD");
    }

    #[test]
    fn parse_selectors_trims_and_skips_blanks() {
        let selectors = parse_selectors(" T.AAPL ,, Q.MSFT").unwrap();
        assert_eq!(selectors.len(), 2);
    }
}
