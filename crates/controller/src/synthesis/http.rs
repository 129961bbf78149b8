//! HTTP client for a remote synthesis service

use super::{
    AgentContext, PersonaInfo, SynthesisError, SynthesisRequest, SynthesisResponse, Synthesizer,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

const SYNTHESIZE_PATH: &str = "/v1/synthesize";
const DISTILL_PATH: &str = "/v1/distill-persona";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DistillRequest<'a> {
    persona: &'a PersonaInfo,
    agent_context: &'a AgentContext,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DistillResponse {
    #[serde(default)]
    distilled: String,
}

/// Synthesizer that posts requests as JSON to `{endpoint}/v1/...`
#[derive(Debug, Clone)]
pub struct HttpSynthesizer {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpSynthesizer {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, SynthesisError> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(SynthesisError::Config(format!(
                "endpoint must be an http(s) URL, got '{endpoint}'"
            )));
        }

        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, endpoint })
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, SynthesisError>
    where
        B: Serialize + ?Sized + Sync,
        R: for<'de> Deserialize<'de>,
    {
        let resp = self
            .http
            .post(format!("{}{path}", self.endpoint))
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SynthesisError::Service {
                status: status.as_u16(),
                body,
            });
        }

        Ok(resp.json::<R>().await?)
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    #[instrument(skip(self, request), fields(agent = %request.agent_name, retry = request.is_retry))]
    async fn synthesize_agent(
        &self,
        request: SynthesisRequest,
    ) -> Result<SynthesisResponse, SynthesisError> {
        let response: SynthesisResponse = self.post(SYNTHESIZE_PATH, &request).await?;
        if let Some(error) = response.error.as_deref().filter(|e| !e.trim().is_empty()) {
            return Err(SynthesisError::Rejected(error.to_string()));
        }

        debug!(
            bytes = response.dsl_code.len(),
            duration_seconds = response.duration_seconds,
            validation_errors = response.validation_errors.len(),
            "Received synthesized code"
        );
        Ok(response)
    }

    async fn distill_persona(
        &self,
        persona: PersonaInfo,
        agent: AgentContext,
    ) -> Result<String, SynthesisError> {
        let request = DistillRequest {
            persona: &persona,
            agent_context: &agent,
        };
        let response: DistillResponse = self.post(DISTILL_PATH, &request).await?;
        Ok(response.distilled.trim().to_string())
    }
}
