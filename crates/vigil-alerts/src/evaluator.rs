//! Rule evaluation.
//!
//! The [`Evaluator`] runs a rule's queries through a [`QueryExecutor`] and turns
//! the condition query's samples into one [`EvalResult`] per label set.
//!
//! - value ≠ 0 → [`ResultState::Firing`]
//! - value = 0 → [`ResultState::Normal`]
//! - no samples, or a sample without a numeric value → [`ResultState::NoData`]
//! - executor failure, timeout or missing condition → [`ResultState::Error`]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{AlertError, Result};
use crate::labels::Labels;
use crate::rule::{AlertQuery, AlertRule};

/// One labelled value returned by a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Series labels.
    pub labels: Labels,
    /// Value, `None` when the series has no usable data point.
    pub value: Option<f64>,
}

impl Sample {
    /// Creates a sample.
    #[must_use]
    pub const fn new(labels: Labels, value: Option<f64>) -> Self {
        Self { labels, value }
    }
}

/// Query results keyed by `ref_id`.
pub type QueryResults = HashMap<String, Vec<Sample>>;

/// Executes alert queries.
#[async_trait]
pub trait QueryExecutor: Send + Sync + std::fmt::Debug {
    /// Runs the queries at `now`.
    async fn execute(&self, queries: &[AlertQuery], now: DateTime<Utc>) -> Result<QueryResults>;
}

/// Outcome class of one label set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultState {
    /// Condition is false.
    Normal,
    /// Condition is true.
    Firing,
    /// No data for this label set.
    NoData,
    /// Evaluation failed.
    Error,
}

/// Evaluation result for one label set.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalResult {
    /// Labels returned by the condition query.
    pub labels: Labels,
    /// Outcome.
    pub state: ResultState,
    /// Values of every query for this label set.
    pub values: BTreeMap<String, f64>,
    /// Error message when `state` is `Error`.
    pub error: Option<String>,
}

impl EvalResult {
    /// A single label-less error result.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            labels: Labels::new(),
            state: ResultState::Error,
            values: BTreeMap::new(),
            error: Some(message.into()),
        }
    }

    /// A single label-less no-data result.
    #[must_use]
    pub fn no_data() -> Self {
        Self {
            labels: Labels::new(),
            state: ResultState::NoData,
            values: BTreeMap::new(),
            error: None,
        }
    }
}

/// All results of one rule evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Scheduled evaluation time.
    pub evaluated_at: DateTime<Utc>,
    /// Wall time the evaluation took.
    pub duration: Duration,
    /// One result per label set.
    pub results: Vec<EvalResult>,
}

impl Evaluation {
    /// An evaluation consisting of a single error result.
    #[must_use]
    pub fn failed(evaluated_at: DateTime<Utc>, duration: Duration, message: impl Into<String>) -> Self {
        Self {
            evaluated_at,
            duration,
            results: vec![EvalResult::error(message)],
        }
    }

    /// True when the evaluation produced an error result.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.results.iter().any(|r| r.state == ResultState::Error)
    }
}

/// Runs rule queries and classifies their results.
#[derive(Debug, Clone)]
pub struct Evaluator {
    executor: Arc<dyn QueryExecutor>,
    timeout: Duration,
}

impl Evaluator {
    /// Default per-evaluation timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Creates an evaluator.
    #[must_use]
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self {
            executor,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Sets the per-evaluation timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Evaluates a rule at `now`. Never fails: problems become an error result.
    pub async fn evaluate(&self, rule: &AlertRule, now: DateTime<Utc>) -> Evaluation {
        let started = tokio::time::Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.executor.execute(&rule.data, now)).await;
        let duration = started.elapsed();

        let results = match outcome {
            Err(_) => {
                warn!(rule_uid = %rule.uid, timeout = ?self.timeout, "rule evaluation timed out");
                return Evaluation::failed(
                    now,
                    duration,
                    format!("evaluation timed out after {:?}", self.timeout),
                );
            }
            Ok(Err(e)) => {
                debug!(rule_uid = %rule.uid, error = %e, "query execution failed");
                return Evaluation::failed(now, duration, e.to_string());
            }
            Ok(Ok(results)) => results,
        };

        Evaluation {
            evaluated_at: now,
            duration,
            results: classify(rule, &results),
        }
    }
}

/// Turns raw query results into per-label-set results.
#[must_use]
pub fn classify(rule: &AlertRule, results: &QueryResults) -> Vec<EvalResult> {
    let Some(condition) = results.get(&rule.condition) else {
        return vec![EvalResult::error(format!(
            "no result returned for condition {:?}",
            rule.condition
        ))];
    };
    if condition.is_empty() {
        return vec![EvalResult::no_data()];
    }

    condition
        .iter()
        .map(|sample| {
            let mut values = BTreeMap::new();
            for (ref_id, samples) in results {
                if let Some(v) = samples
                    .iter()
                    .find(|s| s.labels == sample.labels)
                    .and_then(|s| s.value)
                    .filter(|v| !v.is_nan())
                {
                    values.insert(ref_id.clone(), v);
                }
            }
            let state = match sample.value {
                None => ResultState::NoData,
                Some(v) if v.is_nan() => ResultState::NoData,
                Some(v) if v == 0.0 => ResultState::Normal,
                Some(_) => ResultState::Firing,
            };
            EvalResult {
                labels: sample.labels.clone(),
                state,
                values,
                error: None,
            }
        })
        .collect()
}

// ============ Executors ============

/// Datasource UID served by [`ConstantExecutor`].
pub const CONSTANT_DATASOURCE_UID: &str = "__constant__";

/// Returns the literal series found in each query model.
///
/// The model is either `{"value": 1}` (one label-less sample) or
/// `{"series": [{"labels": {..}, "value": 1}, ..]}`. A `null` value is a
/// series without data.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantExecutor;

#[derive(Deserialize)]
struct ConstantModel {
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    series: Option<Vec<ConstantSeries>>,
}

#[derive(Deserialize)]
struct ConstantSeries {
    #[serde(default)]
    labels: Labels,
    value: Option<f64>,
}

#[async_trait]
impl QueryExecutor for ConstantExecutor {
    async fn execute(&self, queries: &[AlertQuery], _now: DateTime<Utc>) -> Result<QueryResults> {
        let mut out = QueryResults::new();
        for query in queries {
            let model: ConstantModel =
                serde_json::from_value(query.model.clone()).map_err(|e| AlertError::Execution {
                    reason: format!("query {}: {e}", query.ref_id),
                })?;
            let samples = match (model.series, model.value) {
                (Some(series), _) => series
                    .into_iter()
                    .map(|s| Sample::new(s.labels, s.value))
                    .collect(),
                (None, Some(v)) => vec![Sample::new(Labels::new(), Some(v))],
                (None, None) => Vec::new(),
            };
            out.insert(query.ref_id.clone(), samples);
        }
        Ok(out)
    }
}

/// Instant queries against a Prometheus-compatible HTTP API.
///
/// The query model must contain `{"expr": "<promql>"}`.
#[derive(Debug, Clone)]
pub struct PrometheusExecutor {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum PromData {
    Vector(Vec<PromVectorSample>),
    Scalar((f64, String)),
    Matrix(serde_json::Value),
    String(serde_json::Value),
}

#[derive(Deserialize)]
struct PromVectorSample {
    metric: Labels,
    value: (f64, String),
}

impl PrometheusExecutor {
    /// Creates an executor for the API rooted at `base_url`.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn query(&self, query: &AlertQuery, now: DateTime<Utc>) -> Result<Vec<Sample>> {
        let expr = query
            .model
            .get("expr")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| AlertError::Execution {
                reason: format!("query {} has no expr", query.ref_id),
            })?;
        let at = now - chrono::Duration::seconds(i64::try_from(query.relative_time_range.to).unwrap_or(0));
        let time = format!("{:.3}", at.timestamp_millis() as f64 / 1000.0);

        let response = self
            .client
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", expr), ("time", time.as_str())])
            .send()
            .await
            .map_err(|e| AlertError::Execution {
                reason: format!("query {}: {e}", query.ref_id),
            })?;
        let body: PromResponse = response.json().await.map_err(|e| AlertError::Execution {
            reason: format!("query {}: invalid response: {e}", query.ref_id),
        })?;
        if body.status != "success" {
            return Err(AlertError::Execution {
                reason: body.error.unwrap_or_else(|| "query failed".to_string()),
            });
        }

        match body.data {
            Some(PromData::Vector(samples)) => Ok(samples
                .into_iter()
                .map(|s| Sample::new(s.metric, s.value.1.parse().ok()))
                .collect()),
            Some(PromData::Scalar((_, v))) => Ok(vec![Sample::new(Labels::new(), v.parse().ok())]),
            Some(PromData::Matrix(_) | PromData::String(_)) => Err(AlertError::Execution {
                reason: format!("query {} must return a vector or scalar", query.ref_id),
            }),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl QueryExecutor for PrometheusExecutor {
    async fn execute(&self, queries: &[AlertQuery], now: DateTime<Utc>) -> Result<QueryResults> {
        let mut out = QueryResults::new();
        for query in queries {
            out.insert(query.ref_id.clone(), self.query(query, now).await?);
        }
        Ok(out)
    }
}

/// Dispatches each query to the executor registered for its datasource.
#[derive(Debug, Clone, Default)]
pub struct DatasourceRouter {
    executors: HashMap<String, Arc<dyn QueryExecutor>>,
    fallback: Option<Arc<dyn QueryExecutor>>,
}

impl DatasourceRouter {
    /// Creates a router that knows the constant datasource.
    #[must_use]
    pub fn new() -> Self {
        let mut router = Self::default();
        router
            .executors
            .insert(CONSTANT_DATASOURCE_UID.to_string(), Arc::new(ConstantExecutor));
        router
    }

    /// Registers an executor for a datasource UID.
    #[must_use]
    pub fn with_datasource(mut self, uid: impl Into<String>, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executors.insert(uid.into(), executor);
        self
    }

    /// Sets the executor for queries whose datasource is not registered.
    #[must_use]
    pub fn with_fallback(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }
}

#[async_trait]
impl QueryExecutor for DatasourceRouter {
    async fn execute(&self, queries: &[AlertQuery], now: DateTime<Utc>) -> Result<QueryResults> {
        let mut out = QueryResults::new();
        for query in queries {
            let executor = self
                .executors
                .get(&query.datasource_uid)
                .or(self.fallback.as_ref())
                .ok_or_else(|| AlertError::Execution {
                    reason: format!("datasource {:?} not found", query.datasource_uid),
                })?;
            out.extend(executor.execute(std::slice::from_ref(query), now).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule_with(queries: Vec<AlertQuery>, condition: &str) -> AlertRule {
        let mut builder = AlertRule::builder("r", condition);
        for q in queries {
            builder = builder.query(q);
        }
        builder.build().unwrap()
    }

    fn constant(ref_id: &str, model: serde_json::Value) -> AlertQuery {
        AlertQuery::new(ref_id, model).datasource(CONSTANT_DATASOURCE_UID)
    }

    #[derive(Debug)]
    struct Failing;

    #[async_trait]
    impl QueryExecutor for Failing {
        async fn execute(&self, _: &[AlertQuery], _: DateTime<Utc>) -> Result<QueryResults> {
            Err(AlertError::Execution {
                reason: "boom".to_string(),
            })
        }
    }

    #[derive(Debug)]
    struct Slow;

    #[async_trait]
    impl QueryExecutor for Slow {
        async fn execute(&self, _: &[AlertQuery], _: DateTime<Utc>) -> Result<QueryResults> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(QueryResults::new())
        }
    }

    #[tokio::test]
    async fn nonzero_value_fires() {
        let rule = rule_with(vec![constant("A", json!({"value": 1}))], "A");
        let eval = Evaluator::new(Arc::new(DatasourceRouter::new()))
            .evaluate(&rule, Utc::now())
            .await;
        assert_eq!(eval.results.len(), 1);
        assert_eq!(eval.results[0].state, ResultState::Firing);
        assert_eq!(eval.results[0].values.get("A"), Some(&1.0));
    }

    #[tokio::test]
    async fn zero_value_is_normal() {
        let rule = rule_with(vec![constant("A", json!({"value": 0}))], "A");
        let eval = Evaluator::new(Arc::new(ConstantExecutor)).evaluate(&rule, Utc::now()).await;
        assert_eq!(eval.results[0].state, ResultState::Normal);
    }

    #[tokio::test]
    async fn empty_result_is_no_data() {
        let rule = rule_with(vec![constant("A", json!({"series": []}))], "A");
        let eval = Evaluator::new(Arc::new(ConstantExecutor)).evaluate(&rule, Utc::now()).await;
        assert_eq!(eval.results, vec![EvalResult::no_data()]);
    }

    #[tokio::test]
    async fn null_value_is_no_data_for_that_series() {
        let rule = rule_with(
            vec![constant(
                "A",
                json!({"series": [
                    {"labels": {"host": "a"}, "value": 1},
                    {"labels": {"host": "b"}, "value": null}
                ]}),
            )],
            "A",
        );
        let eval = Evaluator::new(Arc::new(ConstantExecutor)).evaluate(&rule, Utc::now()).await;
        let states: Vec<_> = eval.results.iter().map(|r| r.state).collect();
        assert_eq!(states, vec![ResultState::Firing, ResultState::NoData]);
    }

    #[tokio::test]
    async fn values_of_other_queries_are_captured() {
        let rule = rule_with(
            vec![
                constant("A", json!({"series": [{"labels": {"host": "a"}, "value": 93.5}]})),
                constant("B", json!({"series": [{"labels": {"host": "a"}, "value": 1}]})),
            ],
            "B",
        );
        let eval = Evaluator::new(Arc::new(ConstantExecutor)).evaluate(&rule, Utc::now()).await;
        let values = &eval.results[0].values;
        assert_eq!(values.get("A"), Some(&93.5));
        assert_eq!(values.get("B"), Some(&1.0));
    }

    #[tokio::test]
    async fn executor_error_is_error_result() {
        let rule = rule_with(vec![constant("A", json!({"value": 1}))], "A");
        let eval = Evaluator::new(Arc::new(Failing)).evaluate(&rule, Utc::now()).await;
        assert!(eval.has_error());
        assert!(eval.results[0].error.as_deref().unwrap_or("").contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_error_result() {
        let rule = rule_with(vec![constant("A", json!({"value": 1}))], "A");
        let eval = Evaluator::new(Arc::new(Slow))
            .with_timeout(Duration::from_secs(5))
            .evaluate(&rule, Utc::now())
            .await;
        assert!(eval.has_error());
        assert!(eval.results[0].error.as_deref().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn unknown_datasource_is_error() {
        let rule = rule_with(vec![AlertQuery::new("A", json!({})).datasource("prom")], "A");
        let eval = Evaluator::new(Arc::new(DatasourceRouter::new()))
            .evaluate(&rule, Utc::now())
            .await;
        assert!(eval.has_error());
    }

    #[test]
    fn missing_condition_is_error() {
        let rule = rule_with(vec![constant("A", json!({"value": 1}))], "A");
        let results = classify(&rule, &QueryResults::new());
        assert_eq!(results[0].state, ResultState::Error);
    }

    #[test]
    fn prometheus_vector_response_parses() {
        let body = json!({
            "status": "success",
            "data": {"resultType": "vector", "result": [
                {"metric": {"job": "api"}, "value": [1700000000.0, "0.5"]}
            ]}
        });
        let parsed: PromResponse = serde_json::from_value(body).unwrap();
        match parsed.data {
            Some(PromData::Vector(v)) => {
                assert_eq!(v[0].metric.get("job"), Some("api"));
                assert_eq!(v[0].value.1, "0.5");
            }
            _ => panic!("expected vector"),
        }
    }
}
