//! Symbol eligibility and its content-addressed cache (spec.md §4.2, §4.3).

pub mod cache;
pub mod eligibility;

pub use cache::FilterCache;
pub use eligibility::{EligibilityFilter, EligibilityOutcome};
