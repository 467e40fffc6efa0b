//! Core of a distributed rate limiter for LLM-style APIs.
//!
//! Fronts OpenAI-compatible HTTP endpoints and enforces per-API-key quotas
//! on input tokens, output tokens, and requests per minute. Any number of
//! nodes share one Valkey coordination store; a server-side script makes
//! each admission an atomic check-then-commit over three sliding-window
//! counters, so the fleet behaves as one logical limiter.

pub mod config;
pub mod db;
pub mod endpoints;
pub mod error;
pub mod generator;
pub mod rate_limiting;
pub mod tokens;
pub mod utils;
