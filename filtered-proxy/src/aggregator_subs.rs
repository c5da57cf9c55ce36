use std::collections::HashMap;
use std::sync::Mutex;

use polygon_wire::{ChannelSelector, Selector, SymbolSelector};

/// `<N>Ms.<SYM-or-*>`, refcounted across all clients. Guarded by a single
/// mutex: updates are O(1) and infrequent (one per first-subscribe or
/// last-unsubscribe of a key), so a plain lock is simpler than sharding and
/// never shows up as a bottleneck at the scale this proxy targets.
pub struct AggregatorSubscriptions {
    refcounts: Mutex<HashMap<(u64, String), u32>>,
}

/// What the caller should forward to the ms-aggregator upstream, if
/// anything, as a result of a subscribe/unsubscribe refcount transition.
#[derive(Debug, PartialEq, Eq)]
pub enum RefcountTransition {
    FirstSubscriber(String),
    LastUnsubscribed(String),
    NoChange,
}

impl AggregatorSubscriptions {
    pub fn new() -> Self {
        AggregatorSubscriptions { refcounts: Mutex::new(HashMap::new()) }
    }

    /// `None` if `sel` doesn't name the synthetic `<N>Ms` family (those
    /// never touch the aggregator's refcounts).
    fn ms_bar_key(sel: &Selector) -> Option<(u64, String)> {
        let ChannelSelector::Concrete(polygon_wire::Channel::MsBar(interval_ms)) = sel.channel else {
            return None;
        };
        let symbol = match &sel.symbol {
            SymbolSelector::Wildcard => "*".to_string(),
            SymbolSelector::Concrete(s) => s.clone(),
        };
        Some((interval_ms, symbol))
    }

    pub fn increment(&self, sel: &Selector) -> RefcountTransition {
        let Some((interval_ms, symbol)) = Self::ms_bar_key(sel) else {
            return RefcountTransition::NoChange;
        };
        let mut refcounts = self.refcounts.lock().unwrap();
        let count = refcounts.entry((interval_ms, symbol.clone())).or_insert(0);
        *count += 1;
        if *count == 1 {
            RefcountTransition::FirstSubscriber(format!("{interval_ms}Ms.{symbol}"))
        } else {
            RefcountTransition::NoChange
        }
    }

    /// Every `<N>Ms.<SYM-or-*>` key with at least one subscriber right now,
    /// formatted the same way a subscribe command's `params` field is —
    /// used to resubscribe the shared aggregator connection's whole
    /// refcounted set after a reconnect, since the link coming back up
    /// transparent to clients only holds if they keep receiving bars, not
    /// just keep their sockets open.
    pub fn active_selector_strings(&self) -> Vec<String> {
        self.refcounts
            .lock()
            .unwrap()
            .keys()
            .map(|(interval_ms, symbol)| format!("{interval_ms}Ms.{symbol}"))
            .collect()
    }

    pub fn decrement(&self, sel: &Selector) -> RefcountTransition {
        let Some((interval_ms, symbol)) = Self::ms_bar_key(sel) else {
            return RefcountTransition::NoChange;
        };
        let mut refcounts = self.refcounts.lock().unwrap();
        let key = (interval_ms, symbol.clone());
        match refcounts.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                RefcountTransition::NoChange
            }
            Some(_) => {
                refcounts.remove(&key);
                RefcountTransition::LastUnsubscribed(format!("{interval_ms}Ms.{symbol}"))
            }
            None => RefcountTransition::NoChange,
        }
    }
}

impl Default for AggregatorSubscriptions {
    fn default() -> Self {
        Self::new()
    }
}
