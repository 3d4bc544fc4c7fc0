//! Hibergate - a scale-to-zero reverse proxy for Kubernetes deployments
//!
//! This library provides a proxy that lets deployments hibernate:
//! - Fronts each deployment with a listener on a shared multiplexed gateway
//! - Scales the deployment to zero after a configurable idle timeout
//! - Wakes it back up when traffic arrives, holding or answering requests
//!   while it starts (connect waiter, loading page, fixed response, or 503)
//! - Routes every lifecycle transition through an extension chain: companion
//!   deployments, readiness gating, scheduled always-on windows
//! - Uses connection pooling for efficient backend communication

pub mod config;
pub mod controller;
pub mod engine;
pub mod extensions;
pub mod gateway;
pub mod matcher;
pub mod middleware;
pub mod pool;
pub mod scale;

#[cfg(test)]
mod testutil;
