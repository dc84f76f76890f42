//! Neo4j graph store
//!
//! Talks to the Neo4j HTTP transactional endpoint
//! (`POST {endpoint}/db/{database}/tx/commit`). Components are `Element`
//! nodes keyed by `{uuid, eid}`; connections are `connected` relationships
//! between two matched nodes. Every statement is parameterized.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{edge_endpoints, GraphSession, GraphStore, StoreError, StoreId};
use crate::parser::schema::Element;

const DEFAULT_ENDPOINT: &str = "http://localhost:7474";
const DEFAULT_USER: &str = "neo4j";
const DEFAULT_DATABASE: &str = "neo4j";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const MERGE_VERTEX: &str = "MERGE (e:Element {uuid: $uuid, eid: $eid}) \
     ON CREATE SET e.value = $value, e.class = $class, e.subclass = $subclass \
     RETURN id(e)";

const MERGE_EDGE: &str = "MATCH (s:Element {uuid: $uuid, eid: $source}) \
     MATCH (t:Element {uuid: $uuid, eid: $target}) \
     MERGE (s)-[r:connected]->(t) \
     ON CREATE SET r.eid = $eid, r.exit_x = $exit_x, r.exit_y = $exit_y, \
     r.entry_x = $entry_x, r.entry_y = $entry_y \
     RETURN id(r)";

/// Connection settings for a Neo4j server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Neo4jConfig {
    pub endpoint: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub timeout_secs: u64,
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            user: DEFAULT_USER.to_string(),
            password: String::new(),
            database: DEFAULT_DATABASE.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Neo4jConfig {
    fn commit_url(&self) -> String {
        format!(
            "{}/db/{}/tx/commit",
            self.endpoint.trim_end_matches('/'),
            self.database
        )
    }
}

#[derive(Debug, Serialize)]
struct TxRequest<'a> {
    statements: Vec<Statement<'a>>,
}

#[derive(Debug, Serialize)]
struct Statement<'a> {
    statement: &'a str,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Debug, Deserialize)]
struct TxRow {
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    code: String,
    message: String,
}

/// Neo4j store over HTTP.
pub struct Neo4jStore {
    client: Client,
    config: Arc<Neo4jConfig>,
}

impl Neo4jStore {
    pub fn new(config: Neo4jConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!(endpoint = %config.endpoint, database = %config.database, "neo4j store configured");
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &Neo4jConfig {
        &self.config
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    fn name(&self) -> &str {
        "neo4j"
    }

    async fn open_session(&self) -> Result<Box<dyn GraphSession>, StoreError> {
        // The HTTP API is stateless; a session is a client handle plus its own
        // released flag.
        Ok(Box::new(Neo4jSession {
            client: self.client.clone(),
            config: self.config.clone(),
            released: false,
        }))
    }
}

struct Neo4jSession {
    client: Client,
    config: Arc<Neo4jConfig>,
    released: bool,
}

impl Neo4jSession {
    async fn run(&self, statement: &str, parameters: Value) -> Result<Option<StoreId>, StoreError> {
        if self.released {
            return Err(StoreError::Unavailable("neo4j session already released".to_string()));
        }

        let request = TxRequest {
            statements: vec![Statement {
                statement,
                parameters,
            }],
        };

        let response = self
            .client
            .post(self.config.commit_url())
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(&request)
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Backend(format!("HTTP {status}: {message}")));
        }

        let body: TxResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        first_id(body)
    }
}

#[async_trait]
impl GraphSession for Neo4jSession {
    async fn merge_vertex(&mut self, element: &Element) -> Result<StoreId, StoreError> {
        debug!(uuid = %element.uuid, id = element.id, "neo4j merge vertex");
        self.run(MERGE_VERTEX, vertex_parameters(element))
            .await?
            .ok_or_else(|| StoreError::Backend(format!("MERGE returned no node for {}", element.id)))
    }

    async fn merge_edge(&mut self, element: &Element) -> Result<StoreId, StoreError> {
        let (source, target) = edge_endpoints(element)?;
        debug!(uuid = %element.uuid, id = element.id, source, target, "neo4j merge edge");
        // Both MATCH clauses must hit for a row to come back; report the
        // source as the missing end since the response does not say which.
        self.run(MERGE_EDGE, edge_parameters(element, source, target))
            .await?
            .ok_or_else(|| StoreError::NoMatch {
                uuid: element.uuid.clone(),
                local_id: source,
            })
    }

    fn release(&mut self) {
        self.released = true;
    }
}

fn vertex_parameters(element: &Element) -> Value {
    json!({
        "uuid": element.uuid,
        "eid": element.id,
        "value": element.value,
        "class": element.kind,
        "subclass": element.sub_kind,
    })
}

fn edge_parameters(element: &Element, source: u32, target: u32) -> Value {
    let link = element.link.clone().unwrap_or_default();
    json!({
        "uuid": element.uuid,
        "eid": element.id,
        "source": source,
        "target": target,
        "exit_x": link.exit.x,
        "exit_y": link.exit.y,
        "entry_x": link.entry.x,
        "entry_y": link.entry.y,
    })
}

/// The integer in the first column of the first row, if any.
fn first_id(body: TxResponse) -> Result<Option<StoreId>, StoreError> {
    if let Some(error) = body.errors.into_iter().next() {
        return Err(StoreError::Backend(format!("{}: {}", error.code, error.message)));
    }
    Ok(body
        .results
        .into_iter()
        .next()
        .and_then(|r| r.data.into_iter().next())
        .and_then(|row| row.row.into_iter().next())
        .and_then(|v| v.as_i64()))
}

fn request_error(e: reqwest::Error) -> StoreError {
    if e.is_connect() || e.is_timeout() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}
