//! Rule evaluation side of the Vigil alerting engine.
//!
//! `vigil-alerts` stores alert rules in groups, evaluates them on a shared
//! tick, tracks one state machine per alert instance and hands the resulting
//! firing and resolved alerts to an [`AlertSink`].
//!
//! # Features
//!
//! - **Rule groups**: rules evaluated together on a common interval
//! - **Scheduler**: one ticker, bounded concurrency, no overlapping evaluations
//! - **State tracking**: Normal / Pending / Alerting / NoData / Error per instance
//! - **Templates**: `{{ $labels.x }}` and `{{ $value }}` in labels and annotations
//! - **HA**: single-evaluator coordination with degraded fallback
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use std::time::Duration;
//!
//! use vigil_alerts::evaluator::{Sample, ResultState, classify};
//! use vigil_alerts::{AlertQuery, AlertRule, Labels, RuleGroup};
//!
//! let rule = AlertRule::builder("HighCPU", "A")
//!     .query(AlertQuery::new("A", serde_json::json!({"expr": "cpu > 80"})))
//!     .for_duration(Duration::from_secs(60))
//!     .label("severity", "warning")
//!     .build()
//!     .unwrap();
//! let group = RuleGroup::new(1, "infra", "cpu", Duration::from_secs(30), vec![rule]);
//! group.validate(Duration::from_secs(10)).unwrap();
//!
//! let mut results = HashMap::new();
//! results.insert(
//!     "A".to_string(),
//!     vec![Sample::new(Labels::new().with("host", "web-1"), Some(93.0))],
//! );
//! let evaluated = classify(&group.rules[0], &results);
//! assert_eq!(evaluated[0].state, ResultState::Firing);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod clock;
pub mod error;
pub mod evaluator;
pub mod ha;
pub mod instance;
pub mod labels;
pub mod matcher;
pub mod metrics;
pub mod persist;
pub mod rule;
pub mod rule_store;
pub mod scheduler;
pub mod sink;
pub mod state;
pub mod store;
pub mod template;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AlertError, Result};
pub use evaluator::{
    ConstantExecutor, DatasourceRouter, EvalResult, Evaluation, Evaluator, PrometheusExecutor,
    QueryExecutor,
};
pub use ha::{AlwaysEvaluate, Coordinator, EvaluationGate, HaConfig, MemoryMembership, Role};
pub use instance::{AlertInstance, InstanceKey, InstanceState, StateReason};
pub use labels::{Fingerprint, Labels};
pub use matcher::{MatchType, Matcher, Matchers};
pub use metrics::AlertingMetrics;
pub use persist::JsonStore;
pub use rule::{
    AlertQuery, AlertRule, AlertRuleBuilder, ExecErrState, GroupKey, NoDataState, RuleGroup,
    RuleKey,
};
pub use rule_store::{GroupChange, MemoryRuleStore, RuleStore};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use sink::{AlertSink, CollectingSink, NullSink, PostableAlert};
pub use state::{StateTracker, TrackerConfig};
pub use store::{MemoryStateStore, StateStore};
pub use template::{RuleTemplateData, TemplateEngine};
