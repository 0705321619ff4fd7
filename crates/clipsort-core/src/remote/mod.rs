//! Remote vision-model classification, used as an alternate engine or as a
//! per-item fallback when local CLIP scoring fails.

#[cfg(test)]
pub(crate) mod mock;
pub mod ollama;
pub mod parse;
pub mod provider;

pub use ollama::OllamaClassifier;
pub use parse::{parse_output, ParsedOutput};
pub use provider::{
    classify_with_timeout, create_classifier, ImageInput, RemoteClassifier, RemoteRequest,
    RemoteVerdict, StreamSink,
};
