//! Per-provider wire formats: request bodies, stream decoders, usage mapping.

mod anthropic;
mod bedrock;
mod gemini;
mod ollama;
mod openai;
mod openai_responses;

pub use anthropic::AnthropicDecoder;
pub use bedrock::BedrockDecoder;
pub use gemini::GeminiDecoder;
pub use ollama::OllamaDecoder;
pub use openai::OpenAiChatDecoder;
pub use openai_responses::OpenAiResponsesDecoder;

use crate::client::{ClientConfig, Provider};
use crate::error::Result;
use crate::normalize::ChunkDecoder;
use crate::types::ChatRequest;

/// A fresh decoder for one run.
pub fn decoder_for(provider: Provider) -> Box<dyn ChunkDecoder> {
    match provider {
        Provider::OpenAi
        | Provider::OpenRouter
        | Provider::Grok
        | Provider::Zai
        | Provider::Nebius => Box::new(OpenAiChatDecoder),
        Provider::OpenAiResponses => Box::new(OpenAiResponsesDecoder),
        Provider::Anthropic => Box::new(AnthropicDecoder::default()),
        Provider::Gemini => Box::new(GeminiDecoder),
        Provider::Ollama => Box::new(OllamaDecoder),
        Provider::Bedrock => Box::new(BedrockDecoder::default()),
    }
}

pub(crate) fn request_builder(
    http: &reqwest::Client,
    config: &ClientConfig,
    request: &ChatRequest,
) -> Result<reqwest::RequestBuilder> {
    match config.provider {
        Provider::OpenAi
        | Provider::OpenRouter
        | Provider::Grok
        | Provider::Zai
        | Provider::Nebius => openai::request_builder(http, config, request),
        Provider::OpenAiResponses => openai_responses::request_builder(http, config, request),
        Provider::Anthropic => anthropic::request_builder(http, config, request),
        Provider::Gemini => gemini::request_builder(http, config, request),
        Provider::Ollama => ollama::request_builder(http, config, request),
        Provider::Bedrock => bedrock::request_builder(http, config, request),
    }
}
