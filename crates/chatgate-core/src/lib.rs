#![deny(unsafe_code)]

//! Chat gateway core: canonical chat model, routing, load balancing, the
//! streaming request pipeline, the client-facing HTTP surface, and the
//! abstract collaborator ports the pipeline consumes.
//!
//! Dialect codecs and provider adapters live in their own crates
//! (`chatgate-dialect-*`, `chatgate-provider-*`) and are wired together here
//! only through the [`DialectCodec`](ports::DialectCodec) and
//! [`LlmProvider`](ports::LlmProvider) trait objects.

/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Dialect-neutral error taxonomy and vendor error envelope rendering.
pub mod error;
/// Load-balancing primitives shared by LB groups (spec §4.4).
pub mod lb;
/// Dialect-neutral request/response/delta types (spec §3.1-3.2).
pub mod model;
/// Abstract collaborator ports consumed by the pipeline (spec §6.3) plus the
/// dialect-codec and provider-adapter trait objects the HTTP surface wires
/// together.
pub mod ports;
/// The streaming request pipeline: admission, routing, dispatch, forwarding,
/// accounting (spec §4.5).
pub mod pipeline;
/// Model-to-provider resolution (spec §4.3).
pub mod router;
/// The client-facing axum HTTP surface (spec §6.1).
pub mod server;

pub use error::GatewayError;
pub use pipeline::Pipeline;
pub use router::Router;

/// A boxed, `Send` future — used at trait-object boundaries (ports,
/// providers, codecs) exactly as the teacher's `llm::LlmProvider` trait
/// does, so implementations stay object-safe behind `Box<dyn Trait>`.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
