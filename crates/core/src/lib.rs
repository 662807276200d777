//! Domain layer shared by the import pipeline and the storage crate.
//!
//! Everything in this crate is pure: feed row schemas, the identity
//! reconciliation join, and the meal-program eligibility rules engine.
//! Persistence and orchestration live in the sibling crates.

pub mod reconcile;
pub mod rules;
pub mod types;
