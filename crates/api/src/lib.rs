//! `velopay-api` — HTTP shell over the ledger engine.
//!
//! Deliberately thin: authentication, user profiles, and rate limiting live
//! upstream; this layer resolves request context, enforces the
//! idempotency-key contract, and maps engine outcomes to JSON responses.

pub mod app;
pub mod context;
pub mod middleware;
