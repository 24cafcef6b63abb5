//! Model resolver: model id -> upstream target
//!
//! The dispatcher never decides routing itself; it calls an injected resolver
//! built at startup. The registry behind it is immutable for the life of the
//! process.

use crate::config::Config;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Translate to OpenAI chat-completions
    OpenAiCompat,
    /// Forward the Anthropic request body unchanged
    AnthropicPassthrough,
}

#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub supports_tools: bool,
    pub supports_streaming: bool,
    pub supports_images: bool,
}

impl Capabilities {
    pub fn full() -> Self {
        Capabilities { supports_tools: true, supports_streaming: true, supports_images: true }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub handler_kind: HandlerKind,
    pub base_url: String,
    pub api_path: String,
    pub bearer_token: String,
    pub capabilities: Capabilities,
}

impl UpstreamTarget {
    pub fn url(&self) -> String {
        format!("{}{}", self.base_url, self.api_path)
    }
}

type ResolveFn = dyn Fn(&str) -> Option<UpstreamTarget> + Send + Sync;

/// First-class resolver handed to the dispatcher at startup.
#[derive(Clone)]
pub struct ModelResolver {
    resolve: Arc<ResolveFn>,
}

impl ModelResolver {
    pub fn new<F>(resolve: F) -> Self
    where
        F: Fn(&str) -> Option<UpstreamTarget> + Send + Sync + 'static,
    {
        Self { resolve: Arc::new(resolve) }
    }

    /// The default deployment: every model id maps to the one configured
    /// OpenAI-compatible upstream.
    pub fn single_upstream(config: &Config) -> Self {
        let target = UpstreamTarget {
            handler_kind: HandlerKind::OpenAiCompat,
            base_url: config.upstream_base_url.clone(),
            api_path: config.upstream_api_path.clone(),
            bearer_token: config.upstream_api_key.clone(),
            capabilities: Capabilities::full(),
        };
        Self::new(move |_model_id| Some(target.clone()))
    }

    pub fn resolve(&self, model_id: &str) -> Option<UpstreamTarget> {
        (self.resolve)(model_id)
    }
}
