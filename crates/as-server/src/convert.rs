//! Conversions between the core crates' domain types and the wire types
//! `as-proto` generates from `sampler.proto`.

use as_gossip::{Message, MessageKind};
use as_tracegraph::TraceNode;
use as_types::{Operation, Relation, Rule, RuleSet, Strategy, StrategyKind, StrategyPayload, TaggedValue};
use tonic::Status;

pub fn op_to_proto(op: &Operation) -> as_proto::Operation {
    as_proto::Operation {
        service: op.service().to_string(),
        name: op.name().to_string(),
    }
}

pub fn op_from_proto(op: as_proto::Operation) -> Result<Operation, Status> {
    Operation::new(op.service, op.name).map_err(|e| Status::invalid_argument(e.to_string()))
}

pub fn relation_to_proto(relation: &Relation) -> as_proto::Relation {
    as_proto::Relation {
        from: Some(op_to_proto(relation.from())),
        to: Some(op_to_proto(relation.to())),
    }
}

pub fn relation_from_proto(relation: as_proto::Relation) -> Result<Relation, Status> {
    let from = op_from_proto(relation.from.ok_or_else(|| Status::invalid_argument("relation missing from"))?)?;
    let to = op_from_proto(relation.to.ok_or_else(|| Status::invalid_argument("relation missing to"))?)?;
    Relation::new(from, to).map_err(|e| Status::invalid_argument(e.to_string()))
}

fn tagged_value_to_proto(value: &TaggedValue) -> as_proto::TaggedValue {
    use as_proto::tagged_value::Kind;
    let kind = match value {
        TaggedValue::Bool(b) => Kind::BoolValue(*b),
        TaggedValue::Int(i) => Kind::IntValue(*i),
        TaggedValue::Float(f) => Kind::FloatValue(*f),
        TaggedValue::Str(s) => Kind::StrValue(s.clone()),
    };
    as_proto::TaggedValue { kind: Some(kind) }
}

fn tagged_value_from_proto(value: as_proto::TaggedValue) -> Result<TaggedValue, Status> {
    use as_proto::tagged_value::Kind;
    match value.kind {
        Some(Kind::BoolValue(b)) => Ok(TaggedValue::Bool(b)),
        Some(Kind::IntValue(i)) => Ok(TaggedValue::Int(i)),
        Some(Kind::FloatValue(f)) => Ok(TaggedValue::Float(f)),
        Some(Kind::StrValue(s)) => Ok(TaggedValue::Str(s)),
        None => Err(Status::invalid_argument("tagged value missing kind")),
    }
}

fn operator_to_proto(op: as_types::Operator) -> i32 {
    use as_proto::Operator as P;
    (match op {
        as_types::Operator::Eq => P::Eq,
        as_types::Operator::Ne => P::Ne,
        as_types::Operator::Lt => P::Lt,
        as_types::Operator::Le => P::Le,
        as_types::Operator::Gt => P::Gt,
        as_types::Operator::Ge => P::Ge,
    }) as i32
}

fn operator_from_proto(op: i32) -> Result<as_types::Operator, Status> {
    use as_proto::Operator as P;
    match P::try_from(op).map_err(|_| Status::invalid_argument("unknown operator"))? {
        P::Eq => Ok(as_types::Operator::Eq),
        P::Ne => Ok(as_types::Operator::Ne),
        P::Lt => Ok(as_types::Operator::Lt),
        P::Le => Ok(as_types::Operator::Le),
        P::Gt => Ok(as_types::Operator::Gt),
        P::Ge => Ok(as_types::Operator::Ge),
    }
}

pub fn rule_to_proto(rule: &Rule) -> as_proto::Rule {
    as_proto::Rule {
        tag_name: rule.tag_name.clone(),
        op: operator_to_proto(rule.op),
        value: Some(tagged_value_to_proto(&rule.value)),
    }
}

pub fn rule_from_proto(rule: as_proto::Rule) -> Result<Rule, Status> {
    let op = operator_from_proto(rule.op)?;
    let value = tagged_value_from_proto(rule.value.ok_or_else(|| Status::invalid_argument("rule missing value"))?)?;
    Rule::new(rule.tag_name, op, value).map_err(|e| Status::invalid_argument(e.to_string()))
}

pub fn ruleset_to_proto(rules: &RuleSet) -> as_proto::RuleSet {
    as_proto::RuleSet {
        rules: rules.rules.iter().map(rule_to_proto).collect(),
    }
}

pub fn ruleset_from_proto(rules: as_proto::RuleSet) -> Result<RuleSet, Status> {
    Ok(RuleSet {
        rules: rules.rules.into_iter().map(rule_from_proto).collect::<Result<_, _>>()?,
    })
}

/// The wire `kind` tag is derived from the payload variant alone: `Strategy`
/// stores both fields to mirror the upstream wire shape, but the payload is
/// what's authoritative here.
pub fn strategy_to_proto(strategy: &Strategy) -> as_proto::Strategy {
    use as_proto::strategy_payload::Kind as PayloadKind;
    let (kind, payload) = match &strategy.payload {
        StrategyPayload::Const { always_sample } => (as_proto::StrategyKind::Const, PayloadKind::AlwaysSample(*always_sample)),
        StrategyPayload::Probability { sampling_rate } => {
            (as_proto::StrategyKind::Probability, PayloadKind::SamplingRate(*sampling_rate))
        }
        StrategyPayload::RateLimiting { max_traces_per_second } => (
            as_proto::StrategyKind::RateLimiting,
            PayloadKind::MaxTracesPerSecond(*max_traces_per_second),
        ),
        StrategyPayload::Adaptive { sampling_rate } => {
            (as_proto::StrategyKind::Adaptive, PayloadKind::SamplingRate(*sampling_rate))
        }
        StrategyPayload::Dynamic { sampling_rate } => {
            (as_proto::StrategyKind::Dynamic, PayloadKind::SamplingRate(*sampling_rate))
        }
    };
    debug_assert_eq!(kind as i32, strategy_kind_tag(&strategy.kind));
    as_proto::Strategy {
        service: strategy.operation.service().to_string(),
        operation: Some(op_to_proto(&strategy.operation)),
        kind: kind as i32,
        payload: Some(as_proto::StrategyPayload { kind: Some(payload) }),
    }
}

fn strategy_kind_tag(kind: &StrategyKind) -> i32 {
    (match kind {
        StrategyKind::Const => as_proto::StrategyKind::Const,
        StrategyKind::Probability => as_proto::StrategyKind::Probability,
        StrategyKind::RateLimiting => as_proto::StrategyKind::RateLimiting,
        StrategyKind::Adaptive => as_proto::StrategyKind::Adaptive,
        StrategyKind::Dynamic => as_proto::StrategyKind::Dynamic,
    }) as i32
}

pub fn gossip_message_to_proto(message: &Message) -> as_proto::GossipMessage {
    use as_proto::gossip_message::Kind;
    let kind = match &message.kind {
        MessageKind::NewRelation(r) => Kind::NewRelation(relation_to_proto(r)),
        MessageKind::NewOperation(op) => Kind::NewOperation(op_to_proto(op)),
        MessageKind::ExpiredOperation(op) => Kind::ExpiredOperation(op_to_proto(op)),
        MessageKind::EvaluatingTags(rules) => Kind::EvaluatingTags(ruleset_to_proto(rules)),
    };
    as_proto::GossipMessage {
        msg_id: message.msg_id,
        kind: Some(kind),
    }
}

pub fn gossip_message_from_proto(message: as_proto::GossipMessage) -> Result<Message, Status> {
    use as_proto::gossip_message::Kind;
    let kind = match message.kind.ok_or_else(|| Status::invalid_argument("gossip message missing kind"))? {
        Kind::NewRelation(r) => MessageKind::NewRelation(relation_from_proto(r)?),
        Kind::NewOperation(op) => MessageKind::NewOperation(op_from_proto(op)?),
        Kind::ExpiredOperation(op) => MessageKind::ExpiredOperation(op_from_proto(op)?),
        Kind::EvaluatingTags(rules) => MessageKind::EvaluatingTags(ruleset_from_proto(rules)?),
    };
    Ok(Message { msg_id: message.msg_id, kind })
}

pub fn trace_node_to_proto(node: &TraceNode) -> as_proto::TraceNode {
    as_proto::TraceNode {
        name: node.name.clone(),
        children: node.children.iter().map(trace_node_to_proto).collect(),
    }
}
