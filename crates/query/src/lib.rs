pub mod classifier;
pub mod error;
pub mod frame;
pub mod llm;
pub mod rag;
pub mod stream;
pub mod timing;

#[cfg(test)]
mod testing;

pub use classifier::{ComplexityDecision, classify, describe};
pub use error::QueryError;
pub use frame::{decode_frame, encode_frame, split_frames};
pub use llm::{Fragment, FragmentStream, GenerateOptions, Generation, Generator, OllamaGenerator};
pub use rag::{QueryRequest, RagAnswer, RagConfig, RagEngine};
pub use stream::{ComplexityInfo, RagStream, StreamEvent};
pub use timing::Timings;
