pub mod decider;
pub mod engine;
pub mod registry;
pub mod tooling;
