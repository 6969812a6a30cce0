//! GraphQL engine client.
//!
//! Uses `ureq` (sync) wrapped in `tokio::task::spawn_blocking` so the async
//! runtime is never blocked. Every request carries a global timeout and is
//! retried through [`BackoffPolicy`] on transport errors and retriable HTTP
//! statuses.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::retry::BackoffPolicy;
use crate::traits::ExecutionEngine;
use crate::types::{epoch_seconds, RunDetail, RunSummary};

/// Upper bound on event pages fetched for a single run.
const MAX_EVENT_PAGES: usize = 1000;

/// Added to an inclusive upper bound before it is sent as `updatedBefore`.
const UPDATED_BEFORE_SLACK: time::Duration = time::Duration::milliseconds(1);

const RUN_DETAIL_QUERY: &str = r#"
query RunDetail($runId: ID!, $afterCursor: String) {
  runOrError(runId: $runId) {
    __typename
    ... on Run {
      runId
      status
      startTime
      endTime
      updateTime
      runConfig
      eventConnection(afterCursor: $afterCursor) {
        cursor
        hasMore
        events {
          __typename
          ... on MessageEvent { message timestamp level stepKey }
          ... on ExecutionStepFailureEvent { error { message } }
          ... on ExecutionStepInputEvent { inputName typeCheck { success } }
          ... on ExecutionStepOutputEvent { outputName typeCheck { success } }
        }
      }
    }
    ... on RunNotFoundError { message }
    ... on PythonError { message }
  }
}
"#;

const RECENT_RUNS_QUERY: &str = r#"
query RecentlyUpdatedRuns($limit: Int!, $updatedAfter: Float, $updatedBefore: Float) {
  runsOrError(
    limit: $limit
    filter: { updatedAfter: $updatedAfter, updatedBefore: $updatedBefore }
  ) {
    __typename
    ... on Runs {
      results {
        runId
        status
        updateTime
        tags { key value }
      }
    }
    ... on InvalidPipelineRunsFilterError { message }
    ... on PythonError { message }
  }
}
"#;

/// Connection settings for [`GraphqlEngine`].
#[derive(Debug, Clone)]
pub struct GraphqlEngineConfig {
    /// Engine base URL; queries go to `{base_url}/graphql`.
    pub base_url: String,
    pub auth_token: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl GraphqlEngineConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// [`ExecutionEngine`] backed by a Dagster-compatible GraphQL API.
pub struct GraphqlEngine {
    endpoint: String,
    auth_token: Option<String>,
    backoff: BackoffPolicy,
    agent: ureq::Agent,
}

impl GraphqlEngine {
    pub fn new(config: GraphqlEngineConfig) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(config.timeout))
            .build();
        GraphqlEngine {
            endpoint: format!("{}/graphql", config.base_url.trim_end_matches('/')),
            auth_token: config.auth_token,
            backoff: config.backoff,
            agent: ureq::Agent::new_with_config(agent_config),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post_query(
        &self,
        operation: &'static str,
        query: &'static str,
        variables: Value,
    ) -> Result<Value, EngineError> {
        let body = json!({ "query": query, "variables": variables });
        let response = self
            .backoff
            .run(operation, || self.send_once(body.clone()))
            .await?;
        graphql_data(response)
    }

    async fn send_once(&self, body: Value) -> Result<Value, EngineError> {
        let agent = self.agent.clone();
        let endpoint = self.endpoint.clone();
        let auth_token = self.auth_token.clone();

        tokio::task::spawn_blocking(move || {
            let mut request = agent.post(&endpoint);
            if let Some(ref token) = auth_token {
                request = request.header("Authorization", &format!("Bearer {}", token));
            }
            let response = request.send_json(&body)?;
            response
                .into_body()
                .read_json::<Value>()
                .map_err(|e| EngineError::Decode(format!("response is not JSON: {}", e)))
        })
        .await
        .map_err(|e| EngineError::Join(e.to_string()))?
    }
}

#[async_trait]
impl ExecutionEngine for GraphqlEngine {
    async fn get_run_detail(&self, external_run_id: &str) -> Result<RunDetail, EngineError> {
        let mut after_cursor: Option<String> = None;
        let mut detail: Option<RunDetail> = None;

        for _ in 0..MAX_EVENT_PAGES {
            let data = self
                .post_query(
                    "get_run_detail",
                    RUN_DETAIL_QUERY,
                    json!({ "runId": external_run_id, "afterCursor": after_cursor }),
                )
                .await?;
            let page = decode_run_page(external_run_id, &data)?;

            let next_cursor = page.cursor.clone();
            let has_more = page.has_more;
            match detail.as_mut() {
                Some(d) => d.events.extend(page.detail.events),
                None => detail = Some(page.detail),
            }

            if !has_more || next_cursor.is_none() || next_cursor == after_cursor {
                break;
            }
            after_cursor = next_cursor;
        }

        let detail = detail.ok_or_else(|| EngineError::Decode("no run detail page".into()))?;
        debug!(
            run_id = external_run_id,
            status = %detail.status,
            events = detail.events.len(),
            "fetched run detail"
        );
        Ok(detail)
    }

    async fn list_recently_updated_runs(
        &self,
        limit: usize,
        updated_after: Option<OffsetDateTime>,
        updated_before: Option<OffsetDateTime>,
    ) -> Result<Vec<RunSummary>, EngineError> {
        // The engine's `updatedBefore` is exclusive. Runs newer than the
        // bound were already listed, so widening it only repeats them.
        let updated_before = updated_before.map(|ts| ts + UPDATED_BEFORE_SLACK);
        let data = self
            .post_query(
                "list_recently_updated_runs",
                RECENT_RUNS_QUERY,
                json!({
                    "limit": limit,
                    "updatedAfter": updated_after.map(float_seconds),
                    "updatedBefore": updated_before.map(float_seconds),
                }),
            )
            .await?;
        decode_run_list(&data)
    }
}

fn float_seconds(ts: OffsetDateTime) -> f64 {
    ts.unix_timestamp_nanos() as f64 / 1e9
}

/// One page of a run-detail response.
#[derive(Debug)]
struct RunPage {
    detail: RunDetail,
    cursor: Option<String>,
    has_more: bool,
}

// ─── Response shapes ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Deserialize)]
struct GraphqlError {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct ErrorNode {
    #[serde(default)]
    message: Option<String>,
}

impl ErrorNode {
    fn into_message(self) -> String {
        self.message.unwrap_or_else(|| "(no message)".to_string())
    }
}

#[derive(Deserialize)]
struct RunDetailData {
    #[serde(rename = "runOrError")]
    run_or_error: RunOrError,
}

#[derive(Deserialize)]
#[serde(tag = "__typename")]
enum RunOrError {
    Run(RunNode),
    RunNotFoundError(ErrorNode),
    PythonError(ErrorNode),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunNode {
    #[serde(default)]
    run_id: Option<String>,
    status: String,
    #[serde(default)]
    start_time: Option<Value>,
    #[serde(default)]
    end_time: Option<Value>,
    #[serde(default)]
    update_time: Option<Value>,
    #[serde(default)]
    run_config: Value,
    #[serde(default)]
    event_connection: Option<EventConnection>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventConnection {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    has_more: Option<bool>,
    #[serde(default)]
    events: Option<Vec<Value>>,
}

#[derive(Deserialize)]
struct RunListData {
    #[serde(rename = "runsOrError")]
    runs_or_error: RunsOrError,
}

#[derive(Deserialize)]
#[serde(tag = "__typename")]
enum RunsOrError {
    Runs(RunsNode),
    InvalidPipelineRunsFilterError(ErrorNode),
    PythonError(ErrorNode),
}

#[derive(Deserialize)]
struct RunsNode {
    results: Vec<RunListEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunListEntry {
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    update_time: Option<Value>,
    #[serde(default)]
    tags: Option<Vec<RunTag>>,
}

#[derive(Deserialize)]
struct RunTag {
    key: Option<String>,
    value: Option<String>,
}

fn timestamp(value: Option<&Value>) -> Option<OffsetDateTime> {
    value.and_then(epoch_seconds)
}

/// Extract `data` from a GraphQL response envelope.
///
/// Errors without data are fatal; errors alongside data are logged.
fn graphql_data(response: Value) -> Result<Value, EngineError> {
    let envelope = Envelope::deserialize(response)
        .map_err(|e| EngineError::Decode(format!("malformed GraphQL envelope: {}", e)))?;
    let messages: Vec<String> = envelope
        .errors
        .into_iter()
        .map(|e| e.message.unwrap_or_else(|| "unknown error".to_string()))
        .collect();

    match envelope.data {
        Some(data) => {
            if !messages.is_empty() {
                warn!(errors = ?messages, "engine returned partial data with errors");
            }
            Ok(data)
        }
        None if !messages.is_empty() => Err(EngineError::Engine(messages.join("; "))),
        None => Err(EngineError::Decode("response has neither data nor errors".into())),
    }
}

fn decode_run_page(run_id: &str, data: &Value) -> Result<RunPage, EngineError> {
    let decoded = RunDetailData::deserialize(data)
        .map_err(|e| EngineError::Decode(format!("runOrError: {}", e)))?;

    let node = match decoded.run_or_error {
        RunOrError::Run(node) => node,
        RunOrError::RunNotFoundError(_) => {
            return Err(EngineError::RunNotFound {
                run_id: run_id.to_string(),
            })
        }
        RunOrError::PythonError(error) => return Err(EngineError::Engine(error.into_message())),
    };

    let connection = node.event_connection.unwrap_or(EventConnection {
        cursor: None,
        has_more: None,
        events: None,
    });

    Ok(RunPage {
        detail: RunDetail {
            run_id: node.run_id.unwrap_or_else(|| run_id.to_string()),
            status: node.status,
            start_time: timestamp(node.start_time.as_ref()),
            end_time: timestamp(node.end_time.as_ref()),
            update_time: timestamp(node.update_time.as_ref()),
            config: node.run_config,
            events: connection.events.unwrap_or_default(),
        },
        cursor: connection.cursor,
        has_more: connection.has_more.unwrap_or(false),
    })
}

fn decode_run_list(data: &Value) -> Result<Vec<RunSummary>, EngineError> {
    let decoded = RunListData::deserialize(data)
        .map_err(|e| EngineError::Decode(format!("runsOrError: {}", e)))?;

    let results = match decoded.runs_or_error {
        RunsOrError::Runs(node) => node.results,
        RunsOrError::InvalidPipelineRunsFilterError(error) | RunsOrError::PythonError(error) => {
            return Err(EngineError::Engine(error.into_message()))
        }
    };

    let mut runs = Vec::with_capacity(results.len());
    for entry in results {
        let Some(run_id) = entry.run_id else {
            warn!("skipping run listing entry without runId");
            continue;
        };
        let Some(update_time) = timestamp(entry.update_time.as_ref()) else {
            warn!(run_id = %run_id, "skipping run listing entry without a valid updateTime");
            continue;
        };
        let tags: BTreeMap<String, String> = entry
            .tags
            .unwrap_or_default()
            .into_iter()
            .filter_map(|t| Some((t.key?, t.value?)))
            .collect();

        runs.push(RunSummary {
            run_id,
            status: entry.status.unwrap_or_default(),
            update_time,
            tags,
        });
    }

    runs.sort_by(|a, b| b.update_time.cmp(&a.update_time));
    Ok(runs)
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_trims_trailing_slash() {
        let engine = GraphqlEngine::new(GraphqlEngineConfig::new("http://engine:3000/"));
        assert_eq!(engine.endpoint(), "http://engine:3000/graphql");
    }

    #[test]
    fn graphql_errors_without_data_are_engine_errors() {
        let response = json!({"errors": [{"message": "boom"}, {"message": "bang"}]});
        let err = graphql_data(response).unwrap_err();
        assert!(matches!(err, EngineError::Engine(ref m) if m == "boom; bang"));
    }

    #[test]
    fn graphql_partial_data_is_accepted() {
        let response = json!({"data": {"x": 1}, "errors": [{"message": "minor"}]});
        assert_eq!(graphql_data(response).unwrap(), json!({"x": 1}));
    }

    #[test]
    fn decode_run_page_reads_run() {
        let data = json!({
            "runOrError": {
                "__typename": "Run",
                "runId": "r1",
                "status": "SUCCESS",
                "startTime": 100.0,
                "endTime": 105.5,
                "updateTime": 106.0,
                "runConfig": {"ops": {}},
                "eventConnection": {
                    "cursor": "c1",
                    "hasMore": true,
                    "events": [{"__typename": "ExecutionStepStartEvent", "timestamp": "100"}]
                }
            }
        });
        let page = decode_run_page("r1", &data).unwrap();
        assert_eq!(page.detail.status, "SUCCESS");
        assert_eq!(page.detail.start_time.unwrap().unix_timestamp(), 100);
        assert_eq!(page.detail.end_time.unwrap().millisecond(), 500);
        assert_eq!(page.detail.events.len(), 1);
        assert_eq!(page.cursor.as_deref(), Some("c1"));
        assert!(page.has_more);
    }

    #[test]
    fn decode_run_page_not_found() {
        let data = json!({"runOrError": {"__typename": "RunNotFoundError", "message": "nope"}});
        let err = decode_run_page("abc", &data).unwrap_err();
        assert!(matches!(err, EngineError::RunNotFound { ref run_id } if run_id == "abc"));
    }

    #[test]
    fn decode_run_page_python_error() {
        let data = json!({"runOrError": {"__typename": "PythonError", "message": "trace"}});
        let err = decode_run_page("abc", &data).unwrap_err();
        assert!(matches!(err, EngineError::Engine(ref m) if m == "trace"));
    }

    #[test]
    fn decode_run_list_sorts_newest_first_and_skips_bad_entries() {
        let data = json!({
            "runsOrError": {
                "__typename": "Runs",
                "results": [
                    {"runId": "old", "status": "SUCCESS", "updateTime": 10.0, "tags": []},
                    {"runId": "new", "status": "STARTED", "updateTime": 20.0,
                     "tags": [{"key": "workflow", "value": "7"}]},
                    {"runId": "broken", "status": "STARTED", "updateTime": null},
                    {"status": "STARTED", "updateTime": 30.0}
                ]
            }
        });
        let runs = decode_run_list(&data).unwrap();
        let ids: Vec<&str> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
        assert_eq!(runs[0].tags.get("workflow").map(String::as_str), Some("7"));
    }

    #[test]
    fn decode_run_list_filter_error() {
        let data = json!({
            "runsOrError": {"__typename": "InvalidPipelineRunsFilterError", "message": "bad filter"}
        });
        assert!(matches!(
            decode_run_list(&data),
            Err(EngineError::Engine(ref m)) if m == "bad filter"
        ));
    }

    #[test]
    fn decode_run_page_without_event_connection() {
        let data = json!({
            "runOrError": {"__typename": "Run", "status": "QUEUED", "runConfig": null}
        });
        let page = decode_run_page("r9", &data).unwrap();
        assert_eq!(page.detail.run_id, "r9");
        assert!(page.detail.config.is_null());
        assert!(page.detail.events.is_empty());
        assert!(page.cursor.is_none());
        assert!(!page.has_more);
    }

    #[test]
    fn decode_rejects_unknown_typename_and_missing_fields() {
        let unknown = json!({"runOrError": {"__typename": "Pipeline", "message": "?"}});
        assert!(matches!(decode_run_page("r1", &unknown), Err(EngineError::Decode(_))));

        let no_status = json!({"runOrError": {"__typename": "Run", "runId": "r1"}});
        assert!(matches!(decode_run_page("r1", &no_status), Err(EngineError::Decode(_))));

        let no_results = json!({"runsOrError": {"__typename": "Runs"}});
        assert!(matches!(decode_run_list(&no_results), Err(EngineError::Decode(_))));

        assert!(matches!(decode_run_list(&json!({})), Err(EngineError::Decode(_))));
    }

    #[test]
    fn decode_run_list_drops_incomplete_tags() {
        let data = json!({
            "runsOrError": {
                "__typename": "Runs",
                "results": [{
                    "runId": "r1",
                    "status": "SUCCESS",
                    "updateTime": "12.5",
                    "tags": [{"key": "team", "value": "data"}, {"key": "orphan"}]
                }]
            }
        });
        let runs = decode_run_list(&data).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].tags.len(), 1);
        assert_eq!(runs[0].tags["team"], "data");
    }

    #[test]
    fn graphql_envelope_with_null_data_and_no_errors_is_a_decode_error() {
        let err = graphql_data(json!({"data": null})).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }
}
