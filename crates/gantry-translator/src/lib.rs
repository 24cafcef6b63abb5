//! Gantry Translator - Bidirectional API format translation
//!
//! Turns Anthropic Messages requests into OpenAI chat-completions payloads
//! and OpenAI streaming chunks back into Anthropic SSE events.
//!
//! The pipeline, in request order:
//! - [`normalize`]: wire request -> canonical request (+ dropped params)
//! - [`request`]: canonical request -> OpenAI payload
//! - [`adapters`]: per-model-family request/response hooks
//! - [`sse`]: upstream bytes -> framed SSE payloads
//! - [`stream`]: OpenAI chunks -> Anthropic stream events
//! - [`assemble`]: stream events -> a single non-streaming response

pub mod adapters;
pub mod assemble;
pub mod identity;
pub mod normalize;
pub mod request;
pub mod sse;
pub mod stream;
pub mod xml_tools;
