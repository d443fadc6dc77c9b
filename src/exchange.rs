//! Exchange routing strategies (spec.md §4.1 "Exchange Types").
//!
//! A closed variant enum dispatches `lookup`/`deliver` instead of a trait
//! object hierarchy (spec.md §9 Design Notes: "a closed variant enum with
//! dispatch in `Channel._route`; no inheritance tree needed").

use crate::error::{Error, Result};
use indexmap::IndexSet;
use regex::Regex;
use std::collections::HashMap;

/// One row of an exchange's binding table (spec.md §3 "Binding").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub routing_key: String,
    pub pattern: String,
    pub queue: String,
}

/// `Exchange` (spec.md §3 "Exchange").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExchangeType {
    Direct,
    Topic,
    Fanout,
}

impl ExchangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Topic => "topic",
            ExchangeType::Fanout => "fanout",
        }
    }

    pub fn parse(s: &str) -> Result<ExchangeType> {
        match s {
            "direct" => Ok(ExchangeType::Direct),
            "topic" => Ok(ExchangeType::Topic),
            "fanout" => Ok(ExchangeType::Fanout),
            other => Err(Error::NotAllowed {
                reason: format!("unknown exchange type {:?}", other),
            }),
        }
    }

    /// Resolve the set of destination queues for a routing key
    /// (spec.md §4.1). Never fails.
    ///
    /// `default_queue` is consulted only for the direct type when the
    /// exchange name is the empty string (the "default" exchange):
    /// spec.md §4.1 "If empty and the exchange name is the empty string...
    /// deliver to queue named rk".
    pub fn lookup(
        self,
        exchange_name: &str,
        bindings: &[Binding],
        routing_key: &str,
        queue_exists: &dyn Fn(&str) -> bool,
    ) -> IndexSet<String> {
        let mut scratch_cache = HashMap::new();
        self.lookup_cached(exchange_name, bindings, routing_key, queue_exists, &mut scratch_cache)
    }

    /// Same as `lookup`, but topic-pattern regexes are read from (and
    /// written to) `topic_cache` instead of being recompiled every call —
    /// `Channel::basic_publish` passes its own per-channel cache so a hot
    /// topic exchange doesn't recompile the same pattern on every publish.
    pub fn lookup_cached(
        self,
        exchange_name: &str,
        bindings: &[Binding],
        routing_key: &str,
        queue_exists: &dyn Fn(&str) -> bool,
        topic_cache: &mut HashMap<String, Regex>,
    ) -> IndexSet<String> {
        match self {
            ExchangeType::Direct => {
                let mut matched: IndexSet<String> = bindings
                    .iter()
                    .filter(|b| b.pattern == routing_key)
                    .map(|b| b.queue.clone())
                    .collect();
                if matched.is_empty() && exchange_name.is_empty() && queue_exists(routing_key) {
                    matched.insert(routing_key.to_owned());
                }
                matched
            }
            ExchangeType::Topic => bindings
                .iter()
                .filter(|b| topic_pattern_matches_cached(&b.pattern, routing_key, topic_cache))
                .map(|b| b.queue.clone())
                .collect(),
            ExchangeType::Fanout => bindings.iter().map(|b| b.queue.clone()).collect(),
        }
    }
}

/// Compile a dotted-glob topic pattern (`*` = exactly one word, `#` = zero
/// or more words) into an anchored regular expression, then test it
/// against a routing key (spec.md §4.1 "topic"), reusing an
/// already-compiled pattern from `cache` when present.
fn topic_pattern_matches_cached(pattern: &str, routing_key: &str, cache: &mut HashMap<String, Regex>) -> bool {
    if !cache.contains_key(pattern) {
        match compile_topic_pattern(pattern) {
            Ok(re) => {
                cache.insert(pattern.to_owned(), re);
            }
            Err(_) => return false,
        }
    }
    cache.get(pattern).map(|re| re.is_match(routing_key)).unwrap_or(false)
}

#[cfg(test)]
fn topic_pattern_matches(pattern: &str, routing_key: &str) -> bool {
    let mut scratch = HashMap::new();
    topic_pattern_matches_cached(pattern, routing_key, &mut scratch)
}

pub fn compile_topic_pattern(pattern: &str) -> Result<Regex> {
    let mut regex_src = String::with_capacity(pattern.len() * 2 + 2);
    regex_src.push('^');
    let words: Vec<&str> = pattern.split('.').collect();
    for (i, word) in words.iter().enumerate() {
        if i > 0 {
            regex_src.push_str(r"\.");
        }
        match *word {
            "*" => regex_src.push_str(r"[^.]+"),
            "#" => {
                // zero-or-more words, including the separating dot itself.
                // Strip the dot we just pushed for i > 0 so "#" can also
                // match zero words.
                if i > 0 {
                    let len = regex_src.len();
                    regex_src.truncate(len - 2);
                    regex_src.push_str(r"(\..+|)");
                } else {
                    regex_src.push_str(r".*");
                }
            }
            literal => regex_src.push_str(&regex::escape(literal)),
        }
    }
    regex_src.push('$');
    Regex::new(&regex_src).map_err(|e| Error::ChannelError {
        reason: format!("invalid topic pattern {:?}: {}", pattern, e),
    })
}

/// Binding table keyed by exchange name, the way `BrokerState` owns it
/// (spec.md §3 "Binding": "Many-to-many between exchanges and queues").
#[derive(Default)]
pub struct BindingTable {
    by_exchange: HashMap<String, Vec<Binding>>,
}

impl BindingTable {
    pub fn new() -> Self {
        BindingTable::default()
    }

    pub fn bindings_for(&self, exchange: &str) -> &[Binding] {
        self.by_exchange
            .get(exchange)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Insert a binding at the front of the table, no-op if it already
    /// exists (spec.md §3 "duplicate insertion is a no-op"; insertion
    /// order taken from `filesystem.py`'s `_queue_bind`, see SPEC_FULL.md §3).
    pub fn bind(&mut self, exchange: &str, routing_key: &str, pattern: &str, queue: &str) {
        let entry = self.by_exchange.entry(exchange.to_owned()).or_default();
        let binding = Binding {
            routing_key: routing_key.to_owned(),
            pattern: pattern.to_owned(),
            queue: queue.to_owned(),
        };
        if !entry.contains(&binding) {
            entry.insert(0, binding);
        }
    }

    pub fn unbind(&mut self, exchange: &str, routing_key: &str, queue: &str) {
        if let Some(entry) = self.by_exchange.get_mut(exchange) {
            entry.retain(|b| !(b.routing_key == routing_key && b.queue == queue));
        }
    }

    /// Remove every binding for an exchange (spec.md §3: "deletion of an
    /// exchange cascades to its bindings").
    pub fn remove_exchange(&mut self, exchange: &str) {
        self.by_exchange.remove(exchange);
    }

    pub fn has_bindings(&self, exchange: &str) -> bool {
        self.by_exchange
            .get(exchange)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    /// Remove every binding that targets a given queue (used when the
    /// queue itself is deleted).
    pub fn remove_queue(&mut self, queue: &str) {
        for entry in self.by_exchange.values_mut() {
            entry.retain(|b| b.queue != queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_false(_: &str) -> bool {
        false
    }

    #[test]
    fn direct_exact_match_only() {
        let mut table = BindingTable::new();
        table.bind("E", "k", "k", "Q1");
        table.bind("E", "other", "other", "Q2");
        let matched = ExchangeType::Direct.lookup("E", table.bindings_for("E"), "k", &always_false);
        assert_eq!(matched.into_iter().collect::<Vec<_>>(), vec!["Q1".to_string()]);
    }

    #[test]
    fn direct_default_exchange_targets_queue_named_by_routing_key() {
        let table = BindingTable::new();
        let exists = |q: &str| q == "my-queue";
        let matched = ExchangeType::Direct.lookup("", table.bindings_for(""), "my-queue", &exists);
        assert_eq!(matched.into_iter().collect::<Vec<_>>(), vec!["my-queue".to_string()]);
    }

    #[test]
    fn topic_star_matches_single_word() {
        assert!(topic_pattern_matches("a.*", "a.b"));
        assert!(!topic_pattern_matches("a.*", "a.b.c"));
        assert!(!topic_pattern_matches("a.*", "a"));
    }

    #[test]
    fn topic_hash_matches_zero_or_more_words() {
        assert!(topic_pattern_matches("a.#", "a"));
        assert!(topic_pattern_matches("a.#", "a.b"));
        assert!(topic_pattern_matches("a.#", "a.b.c"));
        assert!(!topic_pattern_matches("a.#", "x.b"));
    }

    #[test]
    fn topic_scenario_s2_from_spec() {
        let mut table = BindingTable::new();
        table.bind("E", "a.*", "a.*", "Q1");
        table.bind("E", "a.#", "a.#", "Q2");
        table.bind("E", "a.b", "a.b", "Q3");

        let bindings = table.bindings_for("E").to_vec();
        let m1 = ExchangeType::Topic.lookup("E", &bindings, "a.b.c", &always_false);
        assert!(!m1.contains("Q1"));
        assert!(m1.contains("Q2"));
        assert!(!m1.contains("Q3"));

        let m2 = ExchangeType::Topic.lookup("E", &bindings, "a.b", &always_false);
        assert!(m2.contains("Q1"));
        assert!(m2.contains("Q2"));
        assert!(m2.contains("Q3"));
    }

    #[test]
    fn fanout_ignores_pattern_and_dedupes_queue() {
        let mut table = BindingTable::new();
        table.bind("F", "", "", "Q1");
        table.bind("F", "", "", "Q2");
        table.bind("F", "", "", "Q1"); // duplicate binding, same 4-tuple
        let matched = ExchangeType::Fanout.lookup("F", table.bindings_for("F"), "anything", &always_false);
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn duplicate_binding_insertion_is_noop() {
        let mut table = BindingTable::new();
        table.bind("E", "k", "k", "Q");
        table.bind("E", "k", "k", "Q");
        assert_eq!(table.bindings_for("E").len(), 1);
    }
}
