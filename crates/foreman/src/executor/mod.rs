//! Worker pool concurrency primitives (spec §5).

mod slot_token;

pub use slot_token::SlotToken;
