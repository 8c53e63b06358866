use crate::{IndexError, IndexRecord, IndexWriter, ProviderError, RecordStream};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpIndexConfig {
    pub endpoint: String,
    pub credentials: Option<String>,
}

/// Search index reached over HTTP. Records are written with a whole-document
/// `PUT {endpoint}/records/{id}`; search pages through `GET {endpoint}/search`.
#[derive(Clone)]
pub struct HttpIndex {
    client: Client,
    base: Url,
    cfg: Arc<HttpIndexConfig>,
}

#[derive(Debug, Deserialize)]
pub struct SearchPage {
    pub hits: Vec<IndexRecord>,
    #[serde(default)]
    pub next_page: Option<u32>,
}

impl HttpIndex {
    pub fn new(cfg: HttpIndexConfig) -> Result<Self, ProviderError> {
        let base = Url::parse(&cfg.endpoint)
            .map_err(|e| ProviderError::Misconfigured(format!("index endpoint: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ProviderError::Misconfigured(format!(
                "index endpoint is not a base url: {}",
                cfg.endpoint
            )));
        }
        Ok(Self {
            client: Client::new(),
            base,
            cfg: Arc::new(cfg),
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.cfg.credentials {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn search_page(&self, query: &str, page: u32) -> Result<SearchPage, IndexError> {
        let page_param = page.to_string();
        let builder = self
            .client
            .get(self.url(&["search"]))
            .query(&[("q", query), ("page", page_param.as_str())]);
        let resp = self
            .authorized(builder)
            .send()
            .await
            .map_err(|e| IndexError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.bytes().await.unwrap_or(Bytes::from_static(b""));
            return Err(error_for_status(status, &body));
        }
        resp.json()
            .await
            .map_err(|e| IndexError::Unavailable(format!("undecodable search page: {e}")))
    }
}

#[async_trait::async_trait]
impl IndexWriter for HttpIndex {
    async fn upsert(&self, record: &IndexRecord) -> Result<(), IndexError> {
        let builder = self
            .client
            .put(self.url(&["records", record.id.as_str()]))
            .json(record);
        let resp = self
            .authorized(builder)
            .send()
            .await
            .map_err(|e| IndexError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.bytes().await.unwrap_or(Bytes::from_static(b""));
            return Err(error_for_status(status, &body));
        }
        Ok(())
    }

    fn search(&self, query: &str) -> RecordStream {
        let index = self.clone();
        let query = query.to_string();
        async_stream::try_stream! {
            let mut page = Some(0u32);
            while let Some(current) = page {
                let resp = index.search_page(&query, current).await?;
                for hit in resp.hits {
                    yield hit;
                }
                page = resp.next_page.filter(|next| *next > current);
            }
        }
        .boxed()
    }
}

pub(crate) fn error_for_status(status: StatusCode, body: &[u8]) -> IndexError {
    let detail = format!("status {} body {}", status, String::from_utf8_lossy(body));
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            IndexError::Unavailable(detail)
        }
        s if s.is_client_error() => IndexError::Rejected(detail),
        _ => IndexError::Unavailable(detail),
    }
}
