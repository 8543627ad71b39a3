//! Evaluates spans against a replaceable set of tag predicates. Rules are
//! indexed by tag name into six per-operator maps (mirroring the six
//! comparison operators) so a match only has to look at rules that could
//! possibly apply to a given tag.

use as_types::{Operator, Rule, RuleSet, SpanTags, TaggedValue};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct Index {
    eq: HashMap<String, Vec<Rule>>,
    ne: HashMap<String, Vec<Rule>>,
    lt: HashMap<String, Vec<Rule>>,
    le: HashMap<String, Vec<Rule>>,
    gt: HashMap<String, Vec<Rule>>,
    ge: HashMap<String, Vec<Rule>>,
}

impl Index {
    fn from_rules(rules: &[Rule]) -> Self {
        let mut idx = Index::default();
        for rule in rules {
            let map = match rule.op {
                Operator::Eq => &mut idx.eq,
                Operator::Ne => &mut idx.ne,
                Operator::Lt => &mut idx.lt,
                Operator::Le => &mut idx.le,
                Operator::Gt => &mut idx.gt,
                Operator::Ge => &mut idx.ge,
            };
            map.entry(rule.tag_name.clone()).or_default().push(rule.clone());
        }
        idx
    }

    fn matches(&self, key: &str, value: &TaggedValue) -> bool {
        for map in [&self.eq, &self.ne, &self.lt, &self.le, &self.gt, &self.ge] {
            if let Some(rules) = map.get(key) {
                if rules.iter().any(|r| r.matches(value)) {
                    return true;
                }
            }
        }
        false
    }
}

pub struct Evaluator {
    index: RwLock<Index>,
    current: RwLock<RuleSet>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(Index::default()),
            current: RwLock::new(RuleSet::default()),
        }
    }

    /// Replaces the whole rule set atomically.
    pub fn update(&self, rules: RuleSet) {
        *self.index.write() = Index::from_rules(&rules.rules);
        *self.current.write() = rules;
    }

    /// Returns the rule set currently in effect, as last passed to `update`.
    pub fn snapshot(&self) -> RuleSet {
        self.current.read().clone()
    }

    /// True iff any tag on the span matches any indexed rule.
    pub fn evaluate(&self, span: &SpanTags) -> bool {
        let index = self.index.read();
        span.tags.iter().any(|(key, value)| index.matches(key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, TaggedValue)]) -> SpanTags {
        SpanTags {
            tags: pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    #[test]
    fn no_rules_never_matches() {
        let ev = Evaluator::new();
        let span = tags(&[("http.status_code", TaggedValue::Int(500))]);
        assert!(!ev.evaluate(&span));
    }

    #[test]
    fn eq_rule_matches_exact_tag() {
        let ev = Evaluator::new();
        ev.update(RuleSet {
            rules: vec![Rule::new("error", Operator::Eq, TaggedValue::Bool(true)).unwrap()],
        });
        assert!(ev.evaluate(&tags(&[("error", TaggedValue::Bool(true))])));
        assert!(!ev.evaluate(&tags(&[("error", TaggedValue::Bool(false))])));
    }

    #[test]
    fn ge_rule_matches_numeric_threshold() {
        let ev = Evaluator::new();
        ev.update(RuleSet {
            rules: vec![Rule::new("http.status_code", Operator::Ge, TaggedValue::Int(500)).unwrap()],
        });
        assert!(ev.evaluate(&tags(&[("http.status_code", TaggedValue::Int(503))])));
        assert!(!ev.evaluate(&tags(&[("http.status_code", TaggedValue::Int(200))])));
    }

    #[test]
    fn update_is_idempotent() {
        let ev = Evaluator::new();
        let rules = RuleSet {
            rules: vec![Rule::new("error", Operator::Eq, TaggedValue::Bool(true)).unwrap()],
        };
        ev.update(rules.clone());
        let span = tags(&[("error", TaggedValue::Bool(true))]);
        let first = ev.evaluate(&span);
        ev.update(rules);
        let second = ev.evaluate(&span);
        assert_eq!(first, second);
        assert!(first);
    }

    #[test]
    fn snapshot_reflects_last_update() {
        let ev = Evaluator::new();
        assert!(ev.snapshot().rules.is_empty());
        let rules = RuleSet {
            rules: vec![Rule::new("error", Operator::Eq, TaggedValue::Bool(true)).unwrap()],
        };
        ev.update(rules.clone());
        assert_eq!(ev.snapshot(), rules);
    }

    #[test]
    fn update_replaces_prior_rules_entirely() {
        let ev = Evaluator::new();
        ev.update(RuleSet {
            rules: vec![Rule::new("error", Operator::Eq, TaggedValue::Bool(true)).unwrap()],
        });
        ev.update(RuleSet { rules: vec![] });
        assert!(!ev.evaluate(&tags(&[("error", TaggedValue::Bool(true))])));
    }
}
