pub mod adapters;
pub mod error;
pub mod normalizer;
pub mod sse;

pub mod mock;

pub use error::StreamParseError;
pub use mock::{Recording, ScriptedSource, ScriptedTurn};
pub use normalizer::{StreamBuffers, StreamNormalizer};
