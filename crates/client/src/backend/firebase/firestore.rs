use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::value::{decode_fields, encode_document};
use super::{expect_success, read_json, TokenSource};
use crate::backend::{Document, DocumentStore, Fields};
use crate::config::FirebaseConfig;
use crate::error::{Error, Result};

const PAGE_SIZE: &str = "300";

#[derive(Debug, Deserialize)]
struct RemoteDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

impl RemoteDocument {
    fn into_document(self) -> Result<Document> {
        let id = document_id(&self.name)?;
        Ok(Document {
            id,
            fields: decode_fields(&self.fields)?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    documents: Vec<RemoteDocument>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Last path segment of a full document resource name.
fn document_id(name: &str) -> Result<String> {
    name.rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::Decode(format!("bad document name {name}")))
}

/// Query parameters restricting a PATCH to `fields` and refusing to create
/// the document if it is missing.
fn update_params(fields: &Fields) -> Vec<(&'static str, String)> {
    let mut params: Vec<_> = fields
        .keys()
        .map(|name| ("updateMask.fieldPaths", name.clone()))
        .collect();
    params.push(("currentDocument.exists", "true".to_string()));
    params
}

/// Firestore documents through the REST API, authorised with the signed-in
/// user's id token when there is one.
#[derive(Clone)]
pub struct Firestore {
    http: reqwest::Client,
    api_key: String,
    documents_url: String,
    tokens: Arc<dyn TokenSource>,
    /// Per collection, the top-level fields stored as `timestampValue`.
    timestamp_fields: HashMap<String, Vec<String>>,
}

impl Firestore {
    pub fn new(config: &FirebaseConfig, tokens: Arc<dyn TokenSource>) -> Self {
        let documents_url = format!(
            "{}/projects/{}/databases/(default)/documents",
            config.firestore_url.trim_end_matches('/'),
            config.project_id
        );
        Self {
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            documents_url,
            tokens,
            timestamp_fields: HashMap::new(),
        }
    }

    /// Store `fields` of documents in `collection` as Firestore timestamps.
    pub fn with_timestamp_fields(mut self, collection: &str, fields: &[&str]) -> Self {
        self.timestamp_fields.insert(
            collection.to_string(),
            fields.iter().map(|f| f.to_string()).collect(),
        );
        self
    }

    fn encode(&self, collection: &str, fields: &Fields) -> Map<String, Value> {
        let timestamps = self
            .timestamp_fields
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or_default();
        encode_document(fields, timestamps)
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.documents_url, collection)
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}/{}", self.documents_url, collection, id)
    }

    async fn request(&self, method: Method, url: String) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .query(&[("key", &self.api_key)]);
        match self.tokens.id_token().await {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl DocumentStore for Firestore {
    async fn add(&self, collection: &str, fields: Fields) -> Result<String> {
        let resp = self
            .request(Method::POST, self.collection_url(collection))
            .await
            .json(&json!({ "fields": self.encode(collection, &fields) }))
            .send()
            .await?;
        let created: RemoteDocument = read_json(resp).await?;
        let id = document_id(&created.name)?;
        tracing::debug!("Added {}/{}", collection, id);
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Document> {
        let resp = self
            .request(Method::GET, self.document_url(collection, id))
            .await
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("{collection}/{id}")));
        }
        let doc: RemoteDocument = read_json(resp).await?;
        doc.into_document()
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut builder = self
                .request(Method::GET, self.collection_url(collection))
                .await
                .query(&[("pageSize", PAGE_SIZE)]);
            if let Some(token) = &page_token {
                builder = builder.query(&[("pageToken", token)]);
            }
            let page: ListResponse = read_json(builder.send().await?).await?;
            for doc in page.documents {
                documents.push(doc.into_document()?);
            }
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(documents)
    }

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        if fields.is_empty() {
            // An empty mask would replace the whole document.
            self.get(collection, id).await?;
            return Ok(());
        }
        let resp = self
            .request(Method::PATCH, self.document_url(collection, id))
            .await
            .query(&update_params(&fields))
            .json(&json!({ "fields": self.encode(collection, &fields) }))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("{collection}/{id}")));
        }
        expect_success(resp).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let resp = self
            .request(Method::DELETE, self.document_url(collection, id))
            .await
            .send()
            .await?;
        expect_success(resp).await
    }
}
