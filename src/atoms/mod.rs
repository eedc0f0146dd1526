// ── Aviary Atoms ────────────────────────────────────────────────────────────
// Plain data: struct/enum definitions and the canonical error type.
// No I/O, no engine logic — everything here is serde-serializable and
// usable from both the engine and the CLI.

pub mod error;
pub mod memory_types;
pub mod room_types;
pub mod types;
