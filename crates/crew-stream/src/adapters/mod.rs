//! One adapter per provider wire format, selected by an exhaustive match.

mod anthropic;
mod google;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use openai::OpenAiAdapter;

use crew_core::provider::ProviderKind;
use crew_core::stream::CanonicalEvent;

use crate::error::StreamParseError;
use crate::normalizer::StreamBuffers;

pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Translate one raw chunk. Must not touch `buffers` when returning an error.
    fn translate(
        &self,
        buffers: &mut StreamBuffers,
        chunk: &str,
    ) -> Result<Vec<CanonicalEvent>, StreamParseError>;
}

pub fn adapter_for(kind: ProviderKind) -> &'static dyn ProviderAdapter {
    match kind {
        ProviderKind::Anthropic => &AnthropicAdapter,
        ProviderKind::OpenAi => &OpenAiAdapter,
        ProviderKind::Google => &GoogleAdapter,
    }
}

/// Parse a chunk into `T`, telling "not JSON" apart from "wrong shape".
pub(crate) fn decode<T: serde::de::DeserializeOwned>(chunk: &str) -> Result<T, StreamParseError> {
    let value: serde_json::Value = serde_json::from_str(chunk)?;
    serde_json::from_value(value).map_err(|e| StreamParseError::UnexpectedShape(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_matching_adapter() {
        for kind in ProviderKind::ALL {
            assert_eq!(adapter_for(kind).kind(), kind);
        }
    }

    #[test]
    fn decode_distinguishes_errors() {
        #[derive(serde::Deserialize)]
        struct Needs {
            #[allow(dead_code)]
            field: u32,
        }
        assert!(matches!(
            decode::<Needs>("nope"),
            Err(StreamParseError::NotJson(_))
        ));
        assert!(matches!(
            decode::<Needs>(r#"{"other":1}"#),
            Err(StreamParseError::UnexpectedShape(_))
        ));
    }
}
