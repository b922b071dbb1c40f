//! The edge model: static routing rules between executors.
//!
//! Edges are immutable values created at graph-build time. A message emitted
//! by an executor is resolved against every edge whose source includes that
//! executor; the scheduler performs the resolution between supersteps.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::executor::ExecutorId;
use crate::message::AnyMessage;

/// Predicate gating a direct edge or selecting a switch case.
pub type EdgePredicate = Arc<dyn Fn(&AnyMessage) -> bool + Send + Sync>;

/// Maps a message plus a per-edge ordinal to the sink indices that receive
/// it. Absent a partitioner, fan-out broadcasts.
pub type FanOutPartitioner = Arc<dyn Fn(&AnyMessage, usize) -> Vec<usize> + Send + Sync>;

/// When a fan-in sink fires relative to its sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FanInTrigger {
    /// Fire once per generation, after every source has produced a value.
    #[default]
    All,
    /// Fire on the first arrival of a generation; later arrivals in the same
    /// generation are dropped with a warning.
    Any,
}

/// One case of a switch edge.
#[derive(Clone)]
pub struct SwitchCase {
    pub predicate: EdgePredicate,
    pub sink: ExecutorId,
}

/// A static routing rule.
#[derive(Clone)]
pub enum Edge {
    /// 1:1, optionally conditional.
    Direct {
        source: ExecutorId,
        sink: ExecutorId,
        predicate: Option<EdgePredicate>,
    },
    /// 1:N, with an optional partition function.
    FanOut {
        source: ExecutorId,
        sinks: Vec<ExecutorId>,
        partitioner: Option<FanOutPartitioner>,
    },
    /// N:1, firing per the trigger.
    FanIn {
        sources: Vec<ExecutorId>,
        sink: ExecutorId,
        trigger: FanInTrigger,
    },
    /// Predicated direct edges sharing one source, evaluated in declaration
    /// order; first match wins, then the default, else the message drops.
    Switch {
        source: ExecutorId,
        cases: Vec<SwitchCase>,
        default: Option<ExecutorId>,
    },
}

impl Edge {
    pub fn direct(source: impl Into<ExecutorId>, sink: impl Into<ExecutorId>) -> Self {
        Edge::Direct {
            source: source.into(),
            sink: sink.into(),
            predicate: None,
        }
    }

    pub fn direct_when<P>(
        source: impl Into<ExecutorId>,
        sink: impl Into<ExecutorId>,
        predicate: P,
    ) -> Self
    where
        P: Fn(&AnyMessage) -> bool + Send + Sync + 'static,
    {
        Edge::Direct {
            source: source.into(),
            sink: sink.into(),
            predicate: Some(Arc::new(predicate)),
        }
    }

    pub fn fan_out(
        source: impl Into<ExecutorId>,
        sinks: impl IntoIterator<Item = impl Into<ExecutorId>>,
    ) -> Self {
        Edge::FanOut {
            source: source.into(),
            sinks: sinks.into_iter().map(Into::into).collect(),
            partitioner: None,
        }
    }

    pub fn fan_out_partitioned<P>(
        source: impl Into<ExecutorId>,
        sinks: impl IntoIterator<Item = impl Into<ExecutorId>>,
        partitioner: P,
    ) -> Self
    where
        P: Fn(&AnyMessage, usize) -> Vec<usize> + Send + Sync + 'static,
    {
        Edge::FanOut {
            source: source.into(),
            sinks: sinks.into_iter().map(Into::into).collect(),
            partitioner: Some(Arc::new(partitioner)),
        }
    }

    pub fn fan_in(
        sources: impl IntoIterator<Item = impl Into<ExecutorId>>,
        sink: impl Into<ExecutorId>,
        trigger: FanInTrigger,
    ) -> Self {
        Edge::FanIn {
            sources: sources.into_iter().map(Into::into).collect(),
            sink: sink.into(),
            trigger,
        }
    }

    /// Whether a message emitted by `id` is routed by this edge.
    pub(crate) fn routes_from(&self, id: &ExecutorId) -> bool {
        match self {
            Edge::Direct { source, .. } => source == id,
            Edge::FanOut { source, .. } => source == id,
            Edge::FanIn { sources, .. } => sources.contains(id),
            Edge::Switch { source, .. } => source == id,
        }
    }

    /// Every executor id this edge mentions, for build-time validation.
    pub(crate) fn referenced_ids(&self) -> Vec<&ExecutorId> {
        match self {
            Edge::Direct { source, sink, .. } => vec![source, sink],
            Edge::FanOut { source, sinks, .. } => {
                let mut ids = vec![source];
                ids.extend(sinks.iter());
                ids
            }
            Edge::FanIn { sources, sink, .. } => {
                let mut ids: Vec<&ExecutorId> = sources.iter().collect();
                ids.push(sink);
                ids
            }
            Edge::Switch {
                source,
                cases,
                default,
            } => {
                let mut ids = vec![source];
                ids.extend(cases.iter().map(|case| &case.sink));
                if let Some(default) = default {
                    ids.push(default);
                }
                ids
            }
        }
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Direct {
                source,
                sink,
                predicate,
            } => f
                .debug_struct("Direct")
                .field("source", source)
                .field("sink", sink)
                .field("conditional", &predicate.is_some())
                .finish(),
            Edge::FanOut {
                source,
                sinks,
                partitioner,
            } => f
                .debug_struct("FanOut")
                .field("source", source)
                .field("sinks", sinks)
                .field("partitioned", &partitioner.is_some())
                .finish(),
            Edge::FanIn {
                sources,
                sink,
                trigger,
            } => f
                .debug_struct("FanIn")
                .field("sources", sources)
                .field("sink", sink)
                .field("trigger", trigger)
                .finish(),
            Edge::Switch {
                source,
                cases,
                default,
            } => f
                .debug_struct("Switch")
                .field("source", source)
                .field("cases", &cases.len())
                .field("default", default)
                .finish(),
        }
    }
}

/// Messages gathered by an `All`-trigger fan-in, in declared source order.
/// Fan-in sinks register a handler for this type.
#[derive(Debug, Clone)]
pub struct FanInBundle {
    pub items: Vec<AnyMessage>,
}

/// Fluent builder for a switch edge's cases.
#[derive(Default)]
pub struct SwitchBuilder {
    cases: Vec<SwitchCase>,
    default: Option<ExecutorId>,
}

impl SwitchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a case; cases are evaluated in the order they are added.
    pub fn case<P>(mut self, predicate: P, sink: impl Into<ExecutorId>) -> Self
    where
        P: Fn(&AnyMessage) -> bool + Send + Sync + 'static,
    {
        self.cases.push(SwitchCase {
            predicate: Arc::new(predicate),
            sink: sink.into(),
        });
        self
    }

    /// Sink for messages matching no case. Without one, unmatched messages
    /// are dropped with a warning.
    pub fn otherwise(mut self, sink: impl Into<ExecutorId>) -> Self {
        self.default = Some(sink.into());
        self
    }

    pub(crate) fn into_edge(self, source: ExecutorId) -> Edge {
        Edge::Switch {
            source,
            cases: self.cases,
            default: self.default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_from() {
        let direct = Edge::direct("a", "b");
        assert!(direct.routes_from(&ExecutorId::new("a")));
        assert!(!direct.routes_from(&ExecutorId::new("b")));

        let fan_in = Edge::fan_in(["x", "y"], "z", FanInTrigger::All);
        assert!(fan_in.routes_from(&ExecutorId::new("x")));
        assert!(fan_in.routes_from(&ExecutorId::new("y")));
        assert!(!fan_in.routes_from(&ExecutorId::new("z")));
    }

    #[test]
    fn test_referenced_ids() {
        let edge = Edge::fan_out("src", ["a", "b", "c"]);
        let ids: Vec<&str> = edge.referenced_ids().iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["src", "a", "b", "c"]);

        let switch = SwitchBuilder::new()
            .case(|_| true, "yes")
            .otherwise("no")
            .into_edge(ExecutorId::new("gate"));
        let ids: Vec<&str> = switch.referenced_ids().iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["gate", "yes", "no"]);
    }

    #[test]
    fn test_direct_when_stores_predicate() {
        let edge = Edge::direct_when("a", "b", |message| message.is::<u32>());
        match edge {
            Edge::Direct { predicate, .. } => {
                let predicate = predicate.unwrap();
                assert!(predicate(&AnyMessage::new(1u32)));
                assert!(!predicate(&AnyMessage::new("no")));
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_switch_case_order_preserved() {
        let edge = SwitchBuilder::new()
            .case(|_| false, "first")
            .case(|_| true, "second")
            .into_edge(ExecutorId::new("gate"));
        match edge {
            Edge::Switch { cases, default, .. } => {
                assert_eq!(cases[0].sink.as_str(), "first");
                assert_eq!(cases[1].sink.as_str(), "second");
                assert!(default.is_none());
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_fan_in_trigger_default_is_all() {
        assert_eq!(FanInTrigger::default(), FanInTrigger::All);
    }
}
