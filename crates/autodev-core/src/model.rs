//! The `ModelClient` trait -- the adapter interface for language-model
//! vendors.
//!
//! The orchestrator never talks to a vendor API directly; stage handlers
//! go through this trait. The trait is intentionally object-safe so it can
//! be shared as `Arc<dyn ModelClient>` across drivers.

use std::fmt;

use async_trait::async_trait;

/// A single completion request, already bound to a concrete model.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Concrete model identifier resolved by the model selector.
    pub model_id: String,
    /// System framing for the stage (what role the model plays).
    pub system: String,
    /// The stage input, serialized for the model.
    pub prompt: String,
}

/// A completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Raw model output; stage handlers parse and validate it.
    pub text: String,
    /// Total tokens consumed, when the vendor reports it.
    pub tokens_used: Option<i64>,
}

/// Errors a vendor adapter can report.
#[derive(Debug, thiserror::Error)]
pub enum ModelClientError {
    /// The vendor endpoint is unreachable or over capacity. Transient;
    /// the driver escalates to the next tier.
    #[error("model unavailable: {0}")]
    Unavailable(String),

    /// The vendor rejected the request outright (bad model id, content
    /// refusal). Not transient.
    #[error("model rejected request: {0}")]
    Rejected(String),
}

/// Adapter interface for calling a language-model vendor.
///
/// Implementations hold no cross-task state and may be reused
/// concurrently if thread-safe.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Human-readable name for this client (e.g. "anthropic", "mock").
    fn name(&self) -> &str;

    /// Run one completion against the requested model.
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ModelClientError>;
}

impl fmt::Debug for dyn ModelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModelClient({})", self.name())
    }
}

// Compile-time assertion: ModelClient must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn ModelClient) {}
};

/// A client for deployments with no vendor wired in. Every call reports
/// `Unavailable` so tasks fail cleanly instead of hanging.
pub struct UnconfiguredModelClient;

#[async_trait]
impl ModelClient for UnconfiguredModelClient {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn complete(
        &self,
        _request: &CompletionRequest,
    ) -> Result<CompletionResponse, ModelClientError> {
        Err(ModelClientError::Unavailable(
            "no model vendor configured".to_string(),
        ))
    }
}
