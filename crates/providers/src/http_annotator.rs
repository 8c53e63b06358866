use crate::{AnnotationResult, Annotator, AnnotatorError, Label, ProviderError, RawColor};
use bytes::Bytes;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct HttpAnnotatorConfig {
    pub endpoint: String,
    pub credentials: Option<String>,
}

/// Annotator speaking a neutral JSON protocol: media bytes are posted to
/// `{endpoint}/v1/labels` and `{endpoint}/v1/colors`.
#[derive(Clone)]
pub struct HttpAnnotator {
    client: Client,
    base: Url,
    cfg: Arc<HttpAnnotatorConfig>,
}

impl HttpAnnotator {
    pub fn new(cfg: HttpAnnotatorConfig) -> Result<Self, ProviderError> {
        let base = Url::parse(&cfg.endpoint)
            .map_err(|e| ProviderError::Misconfigured(format!("annotator endpoint: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ProviderError::Misconfigured(format!(
                "annotator endpoint is not a base url: {}",
                cfg.endpoint
            )));
        }
        Ok(Self {
            client: Client::new(),
            base,
            cfg: Arc::new(cfg),
        })
    }

    fn url(&self, feature: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["v1", feature]);
        }
        url
    }

    async fn post<T: DeserializeOwned>(
        &self,
        feature: &str,
        body: Bytes,
    ) -> Result<T, AnnotatorError> {
        let mut builder = self
            .client
            .post(self.url(feature))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body);
        if let Some(token) = &self.cfg.credentials {
            builder = builder.bearer_auth(token);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| AnnotatorError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.bytes().await.unwrap_or(Bytes::from_static(b""));
            return Err(error_for_status(status, &body));
        }
        resp.json()
            .await
            .map_err(|e| AnnotatorError::Unavailable(format!("undecodable {feature} response: {e}")))
    }
}

#[derive(Deserialize)]
struct LabelsResponse {
    labels: Vec<Label>,
}

#[derive(Deserialize)]
struct ColorsResponse {
    colors: Vec<RawColor>,
}

#[async_trait::async_trait]
impl Annotator for HttpAnnotator {
    async fn annotate(&self, media_path: &str) -> Result<AnnotationResult, AnnotatorError> {
        let bytes = tokio::fs::read(media_path)
            .await
            .map(Bytes::from)
            .map_err(|e| AnnotatorError::Rejected(format!("unreadable media {media_path}: {e}")))?;
        debug!(path = media_path, size = bytes.len(), "annotating");

        // Both facts are one annotation: a failure of either fails the call.
        let labels: LabelsResponse = self.post("labels", bytes.clone()).await?;
        let colors: ColorsResponse = self.post("colors", bytes).await?;

        Ok(AnnotationResult {
            labels: labels.labels,
            dominant_colors: colors.colors,
        })
    }
}

pub(crate) fn error_for_status(status: StatusCode, body: &[u8]) -> AnnotatorError {
    let detail = format!("status {} body {}", status, String::from_utf8_lossy(body));
    if status == StatusCode::TOO_MANY_REQUESTS {
        AnnotatorError::QuotaExceeded(detail)
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        AnnotatorError::Unavailable(detail)
    } else {
        AnnotatorError::Rejected(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(matches!(
            error_for_status(StatusCode::TOO_MANY_REQUESTS, b""),
            AnnotatorError::QuotaExceeded(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::BAD_GATEWAY, b""),
            AnnotatorError::Unavailable(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::UNSUPPORTED_MEDIA_TYPE, b"not an image"),
            AnnotatorError::Rejected(msg) if msg.contains("not an image")
        ));
    }

    #[test]
    fn urls_append_feature_segments() {
        let annotator = HttpAnnotator::new(HttpAnnotatorConfig {
            endpoint: "https://vision.example.com/api/".into(),
            credentials: None,
        })
        .unwrap();
        assert_eq!(
            annotator.url("labels").as_str(),
            "https://vision.example.com/api/v1/labels"
        );
    }

    #[test]
    fn rejects_non_base_endpoint() {
        assert!(HttpAnnotator::new(HttpAnnotatorConfig {
            endpoint: "mailto:ops@example.com".into(),
            credentials: None,
        })
        .is_err());
    }

    #[tokio::test]
    async fn missing_media_is_rejected() {
        let annotator = HttpAnnotator::new(HttpAnnotatorConfig {
            endpoint: "http://127.0.0.1:9".into(),
            credentials: None,
        })
        .unwrap();
        let err = annotator
            .annotate("/definitely/not/here.jpg")
            .await
            .unwrap_err();
        assert!(matches!(err, AnnotatorError::Rejected(_)));
    }

    #[test]
    fn decodes_fractional_channels() {
        let parsed: ColorsResponse =
            serde_json::from_str(r#"{"colors":[{"rgb":[12.6,300.0,-4.0],"weight":0.5}]}"#)
                .unwrap();
        assert_eq!(parsed.colors[0].rgb, (12.6, 300.0, -4.0));
    }
}
