use crate::{AnnotationResult, Annotator, AnnotatorError};

/// Annotator that reports no facts. Useful for dry runs of the pipeline.
#[derive(Debug, Default)]
pub struct NoopAnnotator;

#[async_trait::async_trait]
impl Annotator for NoopAnnotator {
    async fn annotate(&self, _media_path: &str) -> Result<AnnotationResult, AnnotatorError> {
        Ok(AnnotationResult::default())
    }
}
