//! [`bot_fleet_core::FleetStore`] implementations.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
