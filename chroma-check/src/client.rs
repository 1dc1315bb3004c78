use crate::ChromaError;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::instrument;

/// Minimal client for the Chroma HTTP API v2
#[derive(Debug, Clone)]
pub struct ChromaClient {
    client: Client,
    base_url: String,
    tenant: String,
    database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
struct CreateCollection<'a> {
    name: &'a str,
    metadata: Option<Map<String, Value>>,
    get_or_create: bool,
}

/// Records to insert in a collection. All vectors are aligned by index.
#[derive(Debug, Default, Serialize)]
pub struct AddRecords {
    pub ids: Vec<String>,
    pub embeddings: Vec<Vec<f32>>,
    pub documents: Vec<String>,
    pub metadatas: Vec<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    query_embeddings: &'a [Vec<f32>],
    n_results: usize,
    include: &'a [&'a str],
}

/// One inner vector per query embedding
#[derive(Debug, Deserialize)]
pub struct QueryResult {
    pub ids: Vec<Vec<String>>,
    #[serde(default)]
    pub documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    pub distances: Option<Vec<Vec<Option<f32>>>>,
}

#[derive(Debug, Deserialize)]
struct Heartbeat {
    #[serde(rename = "nanosecond heartbeat")]
    nanosecond_heartbeat: u64,
}

impl ChromaClient {
    pub fn new(
        base_url: impl Into<String>,
        tenant: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tenant: tenant.into(),
            database: database.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collections_url(&self) -> String {
        format!(
            "{}/api/v2/tenants/{}/databases/{}/collections",
            self.base_url, self.tenant, self.database
        )
    }

    /// Server clock in nanoseconds
    #[instrument(skip(self))]
    pub async fn heartbeat(&self) -> Result<u64, ChromaError> {
        let url = format!("{}/api/v2/heartbeat", self.base_url);
        let heartbeat: Heartbeat = send(self.client.get(url)).await?;
        Ok(heartbeat.nanosecond_heartbeat)
    }

    #[instrument(skip(self))]
    pub async fn version(&self) -> Result<String, ChromaError> {
        let url = format!("{}/api/v2/version", self.base_url);
        send(self.client.get(url)).await
    }

    #[instrument(skip(self))]
    pub async fn list_collections(&self) -> Result<Vec<Collection>, ChromaError> {
        send(self.client.get(self.collections_url())).await
    }

    /// Fails if a collection with the same name already exists
    #[instrument(skip(self, metadata))]
    pub async fn create_collection(
        &self,
        name: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Collection, ChromaError> {
        let body = CreateCollection {
            name,
            metadata,
            get_or_create: false,
        };
        send(self.client.post(self.collections_url()).json(&body)).await
    }

    #[instrument(skip(self))]
    pub async fn delete_collection(&self, name: &str) -> Result<(), ChromaError> {
        let url = format!("{}/{name}", self.collections_url());
        send_empty(self.client.delete(url)).await
    }

    #[instrument(skip(self, records), fields(records = records.ids.len()))]
    pub async fn add(&self, collection_id: &str, records: &AddRecords) -> Result<(), ChromaError> {
        let url = format!("{}/{collection_id}/add", self.collections_url());
        send_empty(self.client.post(url).json(records)).await
    }

    #[instrument(skip(self, query_embeddings))]
    pub async fn query(
        &self,
        collection_id: &str,
        query_embeddings: &[Vec<f32>],
        n_results: usize,
    ) -> Result<QueryResult, ChromaError> {
        let url = format!("{}/{collection_id}/query", self.collections_url());
        let body = QueryRequest {
            query_embeddings,
            n_results,
            include: &["documents", "distances"],
        };
        send(self.client.post(url).json(&body)).await
    }
}

async fn send_empty(request: RequestBuilder) -> Result<(), ChromaError> {
    checked_body(request).await.map(|_| ())
}

async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ChromaError> {
    let body = checked_body(request).await?;
    Ok(serde_json::from_str(&body)?)
}

async fn checked_body(request: RequestBuilder) -> Result<String, ChromaError> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ChromaError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}
