//! Core library for Tollgate.
//!
//! Tollgate is the control-plane core of a multi-tenant agent-orchestration
//! platform: every privileged operation is mediated against authentication,
//! quota, reliability, and audit contracts before it may mutate shared
//! state. This crate holds the four engines and their ambient subsystems;
//! `tollgate-server` exposes them over HTTP.
//!
//! - [`auth`] — credential verification with lockout, bearer tokens, and
//!   role-to-capability expansion.
//! - [`budget`] — idempotent two-phase token allocation
//!   (reserve → commit | release) over a durable ledger and a fast cache.
//! - [`dlq`] — safe-publish with dead-letter routing and the worker that
//!   drains and classifies failed messages.
//! - [`breaker`] — per-dependency circuit breakers guarding outbound calls.
//!
//! Engines depend on `tollgate-store` trait objects ([`tollgate_store::KvStore`],
//! [`tollgate_store::MessageBus`]) and on traits defined here
//! ([`ledger::BudgetLedger`], [`users::UserDirectory`], [`dlq::DlqStore`],
//! [`audit::AuditSink`]), each with a PostgreSQL and an in-memory
//! implementation, so every engine is exercisable without infrastructure.

pub mod audit;
pub mod auth;
pub mod breaker;
pub mod budget;
pub mod dlq;
pub mod error;
pub mod ledger;
pub mod migrate;
pub mod sanitize;
pub mod token;
pub mod users;
