use warden_domain::error::Result;
use warden_domain::stream::Usage;
use warden_domain::stream::{BoxStream, StreamEvent};
use warden_domain::tool::{Message, ToolCall, ToolDefinition};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `auto | none | required | <tool_name>`, mapped per provider wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
    Named(String),
}

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
    /// Model identifier override. When `None`, the provider uses its default.
    pub model: Option<String>,
    /// Reserved output-token budget for extended reasoning. `None` disables
    /// reasoning; thinking blocks must be stripped from prior messages.
    pub thinking_budget: Option<u32>,
    /// Provider-specific reasoning effort knob (e.g. "low"/"medium"/"high").
    pub reasoning_effort: Option<String>,
    /// Logical caller, recorded on the resulting UsageLog row
    /// (e.g. "agent", "routing", "summarizer", "delegate").
    pub component: String,
    pub job_id: Option<String>,
    pub conversation_id: Option<String>,
}

/// A provider-agnostic chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub thinking: Option<String>,
    pub thinking_signature: Option<String>,
    pub usage: Usage,
    pub cost_usd: f64,
    /// The model that actually produced the response.
    pub model: String,
    /// e.g. "stop", "tool_calls", "length".
    pub stop_reason: Option<String>,
    /// True when `stop_reason` indicates a max-tokens cutoff.
    pub truncated: bool,
}

/// A request for text embeddings.
#[derive(Debug, Clone)]
pub struct EmbeddingsRequest {
    pub input: Vec<String>,
    pub model: Option<String>,
}

/// An embeddings response.
#[derive(Debug, Clone)]
pub struct EmbeddingsResponse {
    pub embeddings: Vec<Vec<f32>>,
}

/// A callback polled while a chat call is in flight; returning `true`
/// aborts the in-flight call within the provider's cancel granularity.
pub type CancellationCheck = std::sync::Arc<dyn Fn() -> bool + Send + Sync>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait that every LLM adapter must implement.
///
/// Implementations are provider-specific adapters (OpenAI-compatible today;
/// the wire format differences for other vendors are an adapter-only
/// concern) that translate between internal types and the HTTP API of a
/// given endpoint.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    ///
    /// When `cancellation_check` is `Some`, the call streams internally and
    /// must be abandonable within ~200ms of the check returning `true`,
    /// raising `Error::Cancelled`.
    async fn chat(
        &self,
        req: ChatRequest,
        cancellation_check: Option<CancellationCheck>,
    ) -> Result<ChatResponse>;

    /// Send a chat completion request and return a stream of events.
    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;

    /// Generate text embeddings.
    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;

    /// The model this instance talks to by default.
    fn default_model(&self) -> &str;
}
