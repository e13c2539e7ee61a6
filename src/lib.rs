//! Aegis: observability and safety core for multi-tenant LLM agent
//! platforms.
//!
//! The crate is the in-process pipeline that enforces safety and quota
//! policy on every agent request and records operational metrics for every
//! execution, tool call, LLM call, and policy decision — without ever
//! letting persistence latency or back-pressure block the request path.
//!
//! | Subsystem | Module | Role |
//! |-----------|--------|------|
//! | Guard pipelines | [`guard`] | Ordered fail-close checks over input and output |
//! | Hook framework | [`hooks`] | Four lifecycle extension points, fail-open |
//! | Tenancy | [`tenant`] | Resolution, quotas, monthly usage |
//! | Ring buffer | [`buffer`] | Lock-free MPMC event queue, drop-counting |
//! | Writer | [`writer`] | Batched drain, cost enrichment, persistence |
//! | Emitters | [`emitters`] | Hook-driven typed event capture |
//! | Cost | [`cost`] | Time-ranged pricing, revision-cached |
//! | Store | [`store`] | Event persistence backends |
//! | Orchestrator | [`orchestrator`] | Composes everything around the agent core |
//! | Admin | [`admin`] | Ingest + health HTTP surface |
//!
//! The agent core itself (ReAct loop, providers, RAG, transports) lives
//! outside this crate behind the [`orchestrator::AgentCore`],
//! [`llm::LlmProvider`], [`tools::Tool`], and [`store::EventStore`] traits.

pub mod admin;
pub mod buffer;
pub mod config;
pub mod cost;
pub mod emitters;
pub mod error;
pub mod events;
pub mod guard;
pub mod health;
pub mod hooks;
pub mod llm;
pub mod observability;
pub mod orchestrator;
pub mod store;
pub mod tenant;
pub mod tools;
pub mod writer;

pub use buffer::RingBuffer;
pub use config::Config;
pub use error::{DefaultMessageResolver, Error, ErrorCode, MessageResolver, Result};
pub use events::{EventPayload, MetricEvent};
pub use health::PipelineHealth;
pub use hooks::{AgentHook, AgentResponse, HookContext, HookRegistry, HookResult};
pub use orchestrator::{AgentCore, AgentRequest, RequestOrchestrator, ToolBroker};
pub use writer::MetricWriter;
