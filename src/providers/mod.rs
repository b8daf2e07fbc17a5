//! Model provider implementations.

pub mod openai;
pub mod sse;

pub use openai::{OpenAiConfig, OpenAiProvider};
