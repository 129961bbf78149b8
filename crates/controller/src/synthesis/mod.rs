//! # Code Synthesis
//!
//! Client side of the external text-generation service that turns instructions
//! (or, for self-healing, error context) into agent code.

use crate::crds::RuntimeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod http;

pub use http::HttpSynthesizer;

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("HTTP request to synthesis service failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Synthesis service returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("Synthesis service reported an error: {0}")]
    Rejected(String),

    #[error("Synthesis service is not configured")]
    Unavailable,

    #[error("Invalid synthesis configuration: {0}")]
    Config(String),
}

/// Failure history handed to the synthesizer on retries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    #[serde(default)]
    pub runtime_errors: Vec<RuntimeError>,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    #[serde(default)]
    pub last_crash_log: String,
    #[serde(default)]
    pub consecutive_failures: i32,
    #[serde(default)]
    pub previous_attempts: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisRequest {
    pub instructions: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_text: Option<String>,
    pub agent_name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_context: Option<ErrorContext>,
    #[serde(default)]
    pub is_retry: bool,
    #[serde(default)]
    pub attempt_number: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_good_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisResponse {
    #[serde(default)]
    pub dsl_code: String,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    /// Error text the service reports alongside a 2xx response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persona details for distillation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub language: String,
}

/// Agent facts the persona is distilled against
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    pub agent_name: String,
    pub instructions: String,
    #[serde(default)]
    pub tools: String,
}

/// Code-generation backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize_agent(
        &self,
        request: SynthesisRequest,
    ) -> Result<SynthesisResponse, SynthesisError>;

    /// Condense a persona into text suitable for a synthesis request
    async fn distill_persona(
        &self,
        persona: PersonaInfo,
        agent: AgentContext,
    ) -> Result<String, SynthesisError>;
}

/// Synthesizer used when no service is configured; every call fails so the
/// fallback generator takes over
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableSynthesizer;

#[async_trait]
impl Synthesizer for UnavailableSynthesizer {
    async fn synthesize_agent(
        &self,
        _request: SynthesisRequest,
    ) -> Result<SynthesisResponse, SynthesisError> {
        Err(SynthesisError::Unavailable)
    }

    async fn distill_persona(
        &self,
        _persona: PersonaInfo,
        _agent: AgentContext,
    ) -> Result<String, SynthesisError> {
        Err(SynthesisError::Unavailable)
    }
}
