// Aviary — Personal AI assistant runtime.
// A team of specialized LLM-backed bots behind chat channels, with strict
// per-room message ordering, a hybrid SQLite memory engine, and an
// autonomous coordinator.

pub mod atoms;
pub mod engine;
