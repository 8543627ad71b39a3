use facet::Facet;
use std::error::Error;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    EmptyField(&'static str),
    SelfRelation,
    EmptyRuleValue(&'static str),
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyField(field) => write!(f, "{field} must be non-empty"),
            Self::SelfRelation => write!(f, "relation endpoints must differ"),
            Self::EmptyRuleValue(field) => write!(f, "{field} must be non-empty"),
        }
    }
}

impl Error for InvariantError {}

/// Identity of a traced call site: `(service, operation name)`.
#[derive(Facet, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Operation {
    service: String,
    name: String,
}

impl Operation {
    pub fn new(service: impl Into<String>, name: impl Into<String>) -> Result<Self, InvariantError> {
        let service = service.into();
        let name = name.into();
        if service.is_empty() {
            return Err(InvariantError::EmptyField("service"));
        }
        if name.is_empty() {
            return Err(InvariantError::EmptyField("name"));
        }
        Ok(Self { service, name })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.name)
    }
}

/// A directed "from calls to" edge between two operations.
#[derive(Facet, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Relation {
    from: Operation,
    to: Operation,
}

impl Relation {
    pub fn new(from: Operation, to: Operation) -> Result<Self, InvariantError> {
        if from == to {
            return Err(InvariantError::SelfRelation);
        }
        Ok(Self { from, to })
    }

    pub fn from(&self) -> &Operation {
        &self.from
    }

    pub fn to(&self) -> &Operation {
        &self.to
    }
}

/// A tagged union of the scalar value kinds a span tag or rule operand may hold.
#[derive(Facet, Debug, Clone, PartialEq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum TaggedValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl TaggedValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// Comparison operator for a `Rule`.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// A single tag predicate: `tag_name <op> value`.
#[derive(Facet, Debug, Clone, PartialEq)]
pub struct Rule {
    pub tag_name: String,
    pub op: Operator,
    pub value: TaggedValue,
}

impl Rule {
    pub fn new(tag_name: impl Into<String>, op: Operator, value: TaggedValue) -> Result<Self, InvariantError> {
        let tag_name = tag_name.into();
        if tag_name.is_empty() {
            return Err(InvariantError::EmptyRuleValue("tag_name"));
        }
        Ok(Self { tag_name, op, value })
    }

    /// Whether `candidate` satisfies this rule. Bools only support `Eq`/`Ne`;
    /// ordering operators against a bool are always false.
    pub fn matches(&self, candidate: &TaggedValue) -> bool {
        match (&self.value, candidate) {
            (TaggedValue::Bool(want), TaggedValue::Bool(got)) => match self.op {
                Operator::Eq => want == got,
                Operator::Ne => want != got,
                _ => false,
            },
            (TaggedValue::Str(want), TaggedValue::Str(got)) => match self.op {
                Operator::Eq => want == got,
                Operator::Ne => want != got,
                Operator::Lt => got < want,
                Operator::Le => got <= want,
                Operator::Gt => got > want,
                Operator::Ge => got >= want,
            },
            _ => match (self.value.as_f64(), candidate.as_f64()) {
                (Some(want), Some(got)) => match self.op {
                    Operator::Eq => got == want,
                    Operator::Ne => got != want,
                    Operator::Lt => got < want,
                    Operator::Le => got <= want,
                    Operator::Gt => got > want,
                    Operator::Ge => got >= want,
                },
                _ => false,
            },
        }
    }
}

/// A replaceable set of rules, matched by `Evaluator::update`.
#[derive(Facet, Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
}

/// Minimal span view the core touches: tags plus parent lineage.
#[derive(Debug, Clone, Default)]
pub struct SpanTags {
    pub tags: Vec<(String, TaggedValue)>,
}

impl SpanTags {
    pub fn get(&self, key: &str) -> Option<&TaggedValue> {
        self.tags.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(TaggedValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Parent `(service, operation)` declared via the `p-svc`/`p-op` tags, if both present and non-empty.
    pub fn parent(&self) -> Option<(&str, &str)> {
        let svc = self.get_str("p-svc").filter(|s| !s.is_empty())?;
        let op = self.get_str("p-op").filter(|s| !s.is_empty())?;
        Some((svc, op))
    }
}

/// Kind of sampling strategy assigned to an operation.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    Const,
    Probability,
    RateLimiting,
    Adaptive,
    Dynamic,
}

#[derive(Facet, Debug, Clone, PartialEq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum StrategyPayload {
    Const { always_sample: bool },
    Probability { sampling_rate: f64 },
    RateLimiting { max_traces_per_second: i64 },
    Adaptive { sampling_rate: f64 },
    Dynamic { sampling_rate: f64 },
}

#[derive(Facet, Debug, Clone, PartialEq)]
pub struct Strategy {
    pub operation: Operation,
    pub kind: StrategyKind,
    pub payload: StrategyPayload,
}

/// Per-operation default when no user override exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultStrategyKind {
    Dynamic,
    Adaptive,
}

// --- Configuration -------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SstConfig {
    pub max_fanout: usize,
}

impl Default for SstConfig {
    fn default() -> Self {
        Self { max_fanout: 4 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GossipConfig {
    pub random_pick: usize,
    pub prob_to_r: f64,
    pub lru_size: usize,
    pub heartbeat_interval: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            random_pick: 5,
            prob_to_r: 0.25,
            lru_size: 10_000,
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    pub expiry_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            expiry_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub min_capacity: usize,
    pub resize_interval: Duration,
    pub retry_expiry: Duration,
    pub worker_count: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_capacity: 65_536,
            resize_interval: Duration::from_secs(5),
            retry_expiry: Duration::from_secs(30),
            worker_count: 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    pub scale_factor: f64,
    pub min_sampling_rate: f64,
    pub default_strategy: DefaultStrategyKind,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scale_factor: 1.0,
            min_sampling_rate: 0.001,
            default_strategy: DefaultStrategyKind::Dynamic,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub node_id_bits: u32,
    pub heartbeat_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            node_id_bits: 20,
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

/// Aggregate configuration for a control-plane instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
    pub sst: SstConfig,
    pub gossip: GossipConfig,
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub manager: ManagerConfig,
    pub registry: RegistryConfig,
}

pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_rejects_empty_fields() {
        assert!(matches!(
            Operation::new("", "op"),
            Err(InvariantError::EmptyField("service"))
        ));
        assert!(matches!(
            Operation::new("svc", ""),
            Err(InvariantError::EmptyField("name"))
        ));
    }

    #[test]
    fn relation_rejects_self_loop() {
        let op = Operation::new("svc", "op").unwrap();
        assert!(matches!(
            Relation::new(op.clone(), op),
            Err(InvariantError::SelfRelation)
        ));
    }

    #[test]
    fn rule_bool_ordering_is_always_false() {
        let rule = Rule::new("ok", Operator::Lt, TaggedValue::Bool(true)).unwrap();
        assert!(!rule.matches(&TaggedValue::Bool(false)));
    }

    #[test]
    fn rule_numeric_cross_type_match() {
        let rule = Rule::new("count", Operator::Ge, TaggedValue::Int(10)).unwrap();
        assert!(rule.matches(&TaggedValue::Float(10.5)));
        assert!(!rule.matches(&TaggedValue::Float(9.9)));
    }

    #[test]
    fn span_tags_parent_requires_both_non_empty() {
        let tags = SpanTags {
            tags: vec![
                ("p-svc".into(), TaggedValue::Str("web".into())),
                ("p-op".into(), TaggedValue::Str("".into())),
            ],
        };
        assert_eq!(tags.parent(), None);
    }

    #[test]
    fn clamp_bounds_value() {
        assert_eq!(clamp(5.0, 0.0, 1.0), 1.0);
        assert_eq!(clamp(-5.0, 0.0, 1.0), 0.0);
        assert_eq!(clamp(0.5, 0.0, 1.0), 0.5);
    }
}
