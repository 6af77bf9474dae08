//! Detection history kept by the backend API under `{base}/detections/`.

use super::{DetectionFilter, DetectionRecord, DetectionStore, NewDetection, StoreError};
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// List responses may be a bare array or a paginated envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListResponse {
    Plain(Vec<DetectionRecord>),
    Paged { results: Vec<DetectionRecord> },
}

impl ListResponse {
    fn into_records(self) -> Vec<DetectionRecord> {
        match self {
            ListResponse::Plain(records) | ListResponse::Paged { results: records } => records,
        }
    }
}

pub struct RestStore {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl RestStore {
    /// `base_url` is the API root, e.g. `https://school.example/api`.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, StoreError> {
        let mut base = Url::parse(base_url.trim()).map_err(|e| StoreError::Url(format!("{base_url}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(StoreError::Url(format!("{base_url}: expected http(s)")));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn collection(&self) -> Result<Url, StoreError> {
        self.base
            .join("detections/")
            .map_err(|e| StoreError::Url(e.to_string()))
    }

    fn item(&self, id: &str) -> Result<Url, StoreError> {
        let mut url = self.collection()?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Url(format!("{} cannot be a base", self.base)))?
            .pop_if_empty()
            .push(id)
            .push("");
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch_all(&self) -> Result<Vec<DetectionRecord>, StoreError> {
        let response = self
            .authorized(self.client.get(self.collection()?))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<ListResponse>().await?.into_records())
    }
}

fn data_url(jpeg: &[u8]) -> String {
    format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(jpeg)
    )
}

#[async_trait]
impl DetectionStore for RestStore {
    async fn append(&self, detection: NewDetection) -> Result<DetectionRecord, StoreError> {
        detection.validate()?;
        let screenshot = data_url(&detection.screenshot_jpeg);
        let record = detection.into_record(uuid::Uuid::new_v4().to_string(), screenshot);

        let body = self
            .authorized(self.client.post(self.collection()?))
            .json(&record)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        // Prefer the server's copy (it may assign its own id).
        match serde_json::from_slice::<DetectionRecord>(&body) {
            Ok(stored) => Ok(stored),
            Err(_) => Ok(record),
        }
    }

    async fn list(&self, filter: &DetectionFilter) -> Result<Vec<DetectionRecord>, StoreError> {
        Ok(filter.apply(self.fetch_all().await?))
    }

    async fn get(&self, id: &str) -> Result<Option<DetectionRecord>, StoreError> {
        let response = self.authorized(self.client.get(self.item(id)?)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let response = self.authorized(self.client.delete(self.item(id)?)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        response.error_for_status()?;
        Ok(true)
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        let mut removed = 0;
        for record in self.fetch_all().await? {
            if self.delete(&record.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
