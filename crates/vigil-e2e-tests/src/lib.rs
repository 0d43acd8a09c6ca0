//! End-to-end tests for Vigil.
//!
//! These tests exercise the full stack:
//! - Rule evaluation from the shared rule store
//! - HA evaluator election and failover between replicas
//! - Silences and notification delivery
//! - The HTTP API with header-based users
//! - Configuration sync to external Alertmanagers

#![cfg(test)]
