pub mod auditor;
pub mod client;
pub mod evaluator;
pub mod extractor;
#[cfg(feature = "openai")]
pub mod openai;
pub mod prompts;
pub mod types;

pub use auditor::*;
pub use client::*;
pub use evaluator::*;
pub use extractor::*;
#[cfg(feature = "openai")]
pub use openai::*;
pub use types::*;
