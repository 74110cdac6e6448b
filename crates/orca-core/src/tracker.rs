//! Typed requests against the Linear GraphQL API.
//!
//! One request helper carries the whole retry/backoff policy; the typed
//! operations on top of it are thin query builders plus response parsing.
//! Auth failures are never retried -- the polling fallback additionally
//! stops itself when it sees one.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::graph::{IssueLinks, IssueRelation};

const DEFAULT_API_URL: &str = "https://api.linear.app/graphql";
const PAGE_SIZE: u32 = 25;
const RATE_LIMIT_HEADER: &str = "X-RateLimit-Requests-Remaining";
const RATE_LIMIT_WARN_BELOW: i64 = 500;
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Errors from the tracker client.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker authentication failed (status {status})")]
    Auth { status: u16 },

    #[error("tracker request failed (status {status}): {body}")]
    Status { status: u16, body: String },

    #[error("tracker network error: {0}")]
    Network(String),

    #[error("tracker returned GraphQL errors: {0}")]
    GraphQl(String),

    #[error("unexpected tracker response shape: {0}")]
    Shape(String),
}

impl TrackerError {
    /// Auth failures are permanent and propagate without retry.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

/// How a response status is handled by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Ok,
    Auth,
    Transient,
    Permanent,
}

fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Ok,
        401 | 403 => StatusClass::Auth,
        429 | 500 | 502 | 503 => StatusClass::Transient,
        _ => StatusClass::Permanent,
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// One tracker issue, flattened to what the synchronizer needs.
#[derive(Debug, Clone)]
pub struct TrackerIssue {
    /// API identifier, used in mutations.
    pub id: String,
    /// Human-facing key (e.g. `ORC-12`); orca's task identifier.
    pub identifier: String,
    pub title: String,
    pub description: Option<String>,
    pub state_name: String,
    pub priority: i64,
    pub project_id: Option<String>,
    pub team_id: Option<String>,
    pub parent_identifier: Option<String>,
    pub has_children: bool,
    pub relations: Vec<IssueRelation>,
    pub inverse_relations: Vec<IssueRelation>,
}

impl TrackerIssue {
    /// The dependency-graph view of this issue.
    pub fn links(&self) -> IssueLinks {
        IssueLinks {
            id: self.identifier.clone(),
            relations: self.relations.clone(),
            inverse_relations: self.inverse_relations.clone(),
        }
    }
}

/// Project metadata.
#[derive(Debug, Clone)]
pub struct ProjectInfo {
    pub description: Option<String>,
    pub team_ids: Vec<String>,
}

/// One workflow state, keyed by display name in the state map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowState {
    pub id: String,
    pub kind: String,
}

// ---------------------------------------------------------------------------
// API trait
// ---------------------------------------------------------------------------

/// The tracker operations the rest of the system depends on. A trait so the
/// synchronizer and poller can be exercised against a fake.
#[async_trait]
pub trait TrackerApi: Send + Sync {
    async fn fetch_issues(&self, project_id: &str) -> Result<Vec<TrackerIssue>, TrackerError>;

    async fn fetch_project(&self, project_id: &str) -> Result<ProjectInfo, TrackerError>;

    async fn fetch_workflow_states(
        &self,
        team_ids: &[String],
    ) -> Result<HashMap<String, WorkflowState>, TrackerError>;

    async fn update_issue_state(
        &self,
        issue_id: &str,
        state_id: &str,
    ) -> Result<(), TrackerError>;

    async fn create_comment(&self, issue_id: &str, body: &str) -> Result<(), TrackerError>;

    async fn create_attachment(
        &self,
        issue_id: &str,
        title: &str,
        url: &str,
    ) -> Result<(), TrackerError>;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Linear GraphQL client.
pub struct TrackerClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl TrackerClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_url(api_key, DEFAULT_API_URL)
    }

    pub fn with_url(api_key: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    /// POST one GraphQL request, retrying transient failures up to three
    /// times with 1, 2, 4 second backoff. Returns the `data` field.
    async fn request(&self, query: &str, variables: Value) -> Result<Value, TrackerError> {
        let body = json!({ "query": query, "variables": variables });
        let mut last_err: Option<TrackerError> = None;

        for attempt in 0..=3 {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF[attempt - 1]).await;
            }

            let response = match self
                .http
                .post(&self.api_url)
                .header("Authorization", self.api_key.as_str())
                .json(&body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(attempt, error = %e, "tracker network failure");
                    last_err = Some(TrackerError::Network(e.to_string()));
                    continue;
                }
            };

            let status = response.status().as_u16();

            if let Some(remaining) = response
                .headers()
                .get(RATE_LIMIT_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
            {
                if remaining < RATE_LIMIT_WARN_BELOW {
                    warn!(remaining, "tracker rate limit running low");
                }
            }

            match classify_status(status) {
                StatusClass::Ok => {
                    let payload: Value = response
                        .json()
                        .await
                        .map_err(|e| TrackerError::Shape(e.to_string()))?;

                    if let Some(errors) = payload.get("errors").filter(|e| !e.is_null()) {
                        return Err(TrackerError::GraphQl(errors.to_string()));
                    }

                    return Ok(payload.get("data").cloned().unwrap_or(Value::Null));
                }
                StatusClass::Auth => return Err(TrackerError::Auth { status }),
                StatusClass::Transient => {
                    let body = response.text().await.unwrap_or_default();
                    warn!(status, attempt, "transient tracker failure");
                    last_err = Some(TrackerError::Status { status, body });
                }
                StatusClass::Permanent => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(TrackerError::Status { status, body });
                }
            }
        }

        Err(last_err.unwrap_or_else(|| TrackerError::Network("retries exhausted".to_string())))
    }
}

#[async_trait]
impl TrackerApi for TrackerClient {
    /// Fetch every issue in a project, 25 per page, cursor-based.
    async fn fetch_issues(&self, project_id: &str) -> Result<Vec<TrackerIssue>, TrackerError> {
        const QUERY: &str = "\
            query Issues($projectId: ID!, $first: Int!, $after: String) {\
              issues(\
                filter: { project: { id: { eq: $projectId } } },\
                first: $first,\
                after: $after\
              ) {\
                nodes {\
                  id identifier title description priority\
                  state { name }\
                  project { id }\
                  team { id }\
                  parent { identifier }\
                  children { nodes { id } }\
                  relations { nodes { type relatedIssue { identifier } } }\
                  inverseRelations { nodes { type issue { identifier } } }\
                }\
                pageInfo { hasNextPage endCursor }\
              }\
            }";

        let mut issues = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let data = self
                .request(
                    QUERY,
                    json!({ "projectId": project_id, "first": PAGE_SIZE, "after": cursor }),
                )
                .await?;

            let connection = data
                .get("issues")
                .ok_or_else(|| TrackerError::Shape("missing issues field".to_string()))?;

            for node in connection
                .get("nodes")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                issues.push(parse_issue(node)?);
            }

            let page_info = connection.get("pageInfo");
            let has_next = page_info
                .and_then(|p| p.get("hasNextPage"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !has_next {
                break;
            }
            cursor = page_info
                .and_then(|p| p.get("endCursor"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        debug!(project_id, count = issues.len(), "fetched tracker issues");
        Ok(issues)
    }

    async fn fetch_project(&self, project_id: &str) -> Result<ProjectInfo, TrackerError> {
        const QUERY: &str = "\
            query Project($id: String!) {\
              project(id: $id) {\
                description\
                teams { nodes { id } }\
              }\
            }";

        let data = self.request(QUERY, json!({ "id": project_id })).await?;
        let project = data
            .get("project")
            .filter(|p| !p.is_null())
            .ok_or_else(|| TrackerError::Shape(format!("project {project_id} not found")))?;

        Ok(parse_project(project))
    }

    /// Workflow states for a set of teams, keyed by state name.
    /// Conflicting names resolve last-team-wins.
    async fn fetch_workflow_states(
        &self,
        team_ids: &[String],
    ) -> Result<HashMap<String, WorkflowState>, TrackerError> {
        const QUERY: &str = "\
            query States($teamIds: [ID!]!) {\
              teams(filter: { id: { in: $teamIds } }) {\
                nodes {\
                  id\
                  states { nodes { id name type } }\
                }\
              }\
            }";

        let data = self.request(QUERY, json!({ "teamIds": team_ids })).await?;
        Ok(parse_workflow_states(&data))
    }

    async fn update_issue_state(
        &self,
        issue_id: &str,
        state_id: &str,
    ) -> Result<(), TrackerError> {
        const QUERY: &str = "\
            mutation UpdateIssue($id: String!, $stateId: String!) {\
              issueUpdate(id: $id, input: { stateId: $stateId }) { success }\
            }";

        let data = self
            .request(QUERY, json!({ "id": issue_id, "stateId": state_id }))
            .await?;
        expect_success(&data, "issueUpdate")
    }

    async fn create_comment(&self, issue_id: &str, body: &str) -> Result<(), TrackerError> {
        const QUERY: &str = "\
            mutation CreateComment($issueId: String!, $body: String!) {\
              commentCreate(input: { issueId: $issueId, body: $body }) { success }\
            }";

        let data = self
            .request(QUERY, json!({ "issueId": issue_id, "body": body }))
            .await?;
        expect_success(&data, "commentCreate")
    }

    async fn create_attachment(
        &self,
        issue_id: &str,
        title: &str,
        url: &str,
    ) -> Result<(), TrackerError> {
        const QUERY: &str = "\
            mutation CreateAttachment($issueId: String!, $title: String!, $url: String!) {\
              attachmentCreate(input: { issueId: $issueId, title: $title, url: $url }) {\
                success\
              }\
            }";

        let data = self
            .request(QUERY, json!({ "issueId": issue_id, "title": title, "url": url }))
            .await?;
        expect_success(&data, "attachmentCreate")
    }
}

fn expect_success(data: &Value, mutation: &str) -> Result<(), TrackerError> {
    let success = data
        .get(mutation)
        .and_then(|m| m.get("success"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if success {
        Ok(())
    } else {
        Err(TrackerError::Shape(format!("{mutation} reported failure")))
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn parse_issue(node: &Value) -> Result<TrackerIssue, TrackerError> {
    let str_field = |key: &str| -> Result<String, TrackerError> {
        node.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TrackerError::Shape(format!("issue missing {key}")))
    };

    let relations = node
        .get("relations")
        .and_then(|r| r.get("nodes"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| {
            let kind = r.get("type").and_then(Value::as_str)?;
            let other = r
                .get("relatedIssue")
                .and_then(|i| i.get("identifier"))
                .and_then(Value::as_str)?;
            Some(IssueRelation {
                kind: kind.to_string(),
                other_id: other.to_string(),
            })
        })
        .collect();

    let inverse_relations = node
        .get("inverseRelations")
        .and_then(|r| r.get("nodes"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| {
            let kind = r.get("type").and_then(Value::as_str)?;
            let other = r
                .get("issue")
                .and_then(|i| i.get("identifier"))
                .and_then(Value::as_str)?;
            Some(IssueRelation {
                kind: kind.to_string(),
                other_id: other.to_string(),
            })
        })
        .collect();

    let has_children = node
        .get("children")
        .and_then(|c| c.get("nodes"))
        .and_then(Value::as_array)
        .map(|nodes| !nodes.is_empty())
        .unwrap_or(false);

    Ok(TrackerIssue {
        id: str_field("id")?,
        identifier: str_field("identifier")?,
        title: str_field("title")?,
        description: node
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        state_name: node
            .get("state")
            .and_then(|s| s.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        priority: node.get("priority").and_then(Value::as_i64).unwrap_or(0),
        project_id: node
            .get("project")
            .and_then(|p| p.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        team_id: node
            .get("team")
            .and_then(|t| t.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        parent_identifier: node
            .get("parent")
            .and_then(|p| p.get("identifier"))
            .and_then(Value::as_str)
            .map(str::to_string),
        has_children,
        relations,
        inverse_relations,
    })
}

fn parse_project(project: &Value) -> ProjectInfo {
    ProjectInfo {
        description: project
            .get("description")
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
            .map(str::to_string),
        team_ids: project
            .get("teams")
            .and_then(|t| t.get("nodes"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|n| n.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect(),
    }
}

fn parse_workflow_states(data: &Value) -> HashMap<String, WorkflowState> {
    let mut map = HashMap::new();

    for team in data
        .get("teams")
        .and_then(|t| t.get("nodes"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        for state in team
            .get("states")
            .and_then(|s| s.get("nodes"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let (Some(id), Some(name), Some(kind)) = (
                state.get("id").and_then(Value::as_str),
                state.get("name").and_then(Value::as_str),
                state.get("type").and_then(Value::as_str),
            ) else {
                continue;
            };
            // Teams iterate in response order, so a later team's state of
            // the same name wins.
            map.insert(
                name.to_string(),
                WorkflowState {
                    id: id.to_string(),
                    kind: kind.to_string(),
                },
            );
        }
    }

    map
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(200), StatusClass::Ok);
        assert_eq!(classify_status(204), StatusClass::Ok);
        assert_eq!(classify_status(401), StatusClass::Auth);
        assert_eq!(classify_status(403), StatusClass::Auth);
        for status in [429, 500, 502, 503] {
            assert_eq!(classify_status(status), StatusClass::Transient);
        }
        assert_eq!(classify_status(400), StatusClass::Permanent);
        assert_eq!(classify_status(404), StatusClass::Permanent);
        assert_eq!(classify_status(504), StatusClass::Permanent);
    }

    #[test]
    fn auth_error_is_flagged() {
        assert!(TrackerError::Auth { status: 401 }.is_auth());
        assert!(!TrackerError::Network("reset".to_string()).is_auth());
    }

    #[test]
    fn parse_issue_full_shape() {
        let node = serde_json::json!({
            "id": "uuid-1",
            "identifier": "ORC-12",
            "title": "Fix login",
            "description": "The login form 500s",
            "priority": 2,
            "state": { "name": "Todo" },
            "project": { "id": "proj-1" },
            "team": { "id": "team-1" },
            "parent": { "identifier": "ORC-10" },
            "children": { "nodes": [{ "id": "uuid-2" }] },
            "relations": { "nodes": [
                { "type": "blocks", "relatedIssue": { "identifier": "ORC-13" } }
            ]},
            "inverseRelations": { "nodes": [
                { "type": "blocks", "issue": { "identifier": "ORC-11" } }
            ]},
        });

        let issue = parse_issue(&node).unwrap();
        assert_eq!(issue.identifier, "ORC-12");
        assert_eq!(issue.title, "Fix login");
        assert_eq!(issue.priority, 2);
        assert_eq!(issue.state_name, "Todo");
        assert_eq!(issue.parent_identifier.as_deref(), Some("ORC-10"));
        assert!(issue.has_children);
        assert_eq!(issue.relations.len(), 1);
        assert_eq!(issue.relations[0].other_id, "ORC-13");
        assert_eq!(issue.inverse_relations[0].other_id, "ORC-11");

        let links = issue.links();
        assert_eq!(links.id, "ORC-12");
    }

    #[test]
    fn parse_issue_minimal_shape() {
        let node = serde_json::json!({
            "id": "uuid-1",
            "identifier": "ORC-1",
            "title": "Bare issue",
        });

        let issue = parse_issue(&node).unwrap();
        assert_eq!(issue.priority, 0);
        assert_eq!(issue.state_name, "");
        assert!(issue.description.is_none());
        assert!(!issue.has_children);
        assert!(issue.relations.is_empty());
    }

    #[test]
    fn parse_issue_missing_identifier_is_shape_error() {
        let node = serde_json::json!({ "id": "uuid-1", "title": "No key" });
        assert!(parse_issue(&node).is_err());
    }

    #[test]
    fn parse_project_extracts_teams() {
        let project = serde_json::json!({
            "description": "repo=/srv/repos/web",
            "teams": { "nodes": [{ "id": "team-1" }, { "id": "team-2" }] },
        });

        let info = parse_project(&project);
        assert_eq!(info.description.as_deref(), Some("repo=/srv/repos/web"));
        assert_eq!(info.team_ids, vec!["team-1", "team-2"]);
    }

    #[test]
    fn workflow_states_last_team_wins() {
        let data = serde_json::json!({
            "teams": { "nodes": [
                { "id": "team-1", "states": { "nodes": [
                    { "id": "s1", "name": "Todo", "type": "unstarted" }
                ]}},
                { "id": "team-2", "states": { "nodes": [
                    { "id": "s2", "name": "Todo", "type": "unstarted" },
                    { "id": "s3", "name": "Done", "type": "completed" }
                ]}},
            ]},
        });

        let map = parse_workflow_states(&data);
        assert_eq!(map.len(), 2);
        assert_eq!(map["Todo"].id, "s2");
        assert_eq!(map["Done"].kind, "completed");
    }

    #[test]
    fn expect_success_checks_mutation_payload() {
        let ok = serde_json::json!({ "issueUpdate": { "success": true } });
        assert!(expect_success(&ok, "issueUpdate").is_ok());

        let failed = serde_json::json!({ "issueUpdate": { "success": false } });
        assert!(expect_success(&failed, "issueUpdate").is_err());

        let missing = serde_json::json!({});
        assert!(expect_success(&missing, "issueUpdate").is_err());
    }
}
