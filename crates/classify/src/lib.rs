pub mod batch;
pub mod provider;
pub mod resolver;

pub use batch::{BatchClassifier, ClassifyInput, CHUNK_SIZE};
pub use provider::{CancelToken, HttpTextGenerator, ProviderError, TextGenerator};
pub use resolver::{CategoryIndex, ResolvedCategory, FALLBACK_CATEGORY};
