/// A chunk that does not match its provider's wire format. Always recovered
/// locally by the normalizer: logged, no event emitted.
#[derive(Debug, thiserror::Error)]
pub enum StreamParseError {
    #[error("chunk is not valid JSON: {0}")]
    NotJson(#[from] serde_json::Error),
    #[error("unexpected chunk shape: {0}")]
    UnexpectedShape(String),
}
