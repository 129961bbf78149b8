/*
 * 5D Labs Agent Platform - Kubernetes Orchestrator for AI Coding Agents
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Adaptive learning and self-healing controller
//!
//! This crate watches `LanguageAgent` resources and adapts their generated code
//! over time: it mines execution traces and failure events for stable patterns,
//! decides when re-synthesis is warranted, publishes versioned code artifacts,
//! rolls them out to the running workload with health verification, and retries
//! crashing agents with bounded exponential backoff.

pub mod artifacts;
pub mod crds;
pub mod events;
pub mod healing;
pub mod learning;
pub mod metrics;
pub mod rollout;
pub mod synthesis;
pub mod tasks;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_apiserver;

// Re-export commonly used types
pub use crds::{LanguageAgent, LanguageAgentSpec, LanguageAgentStatus};
pub use learning::analyzer::{analyze_task_patterns, PatternAnalysis};
pub use learning::triggers::{LearningEvent, TriggerEvaluator, TriggerKind};
pub use tasks::config::ControllerConfig;
