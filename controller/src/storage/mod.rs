//! Record storage and settings

pub mod memory;
pub mod object;
pub mod selector;
pub mod settings;
pub mod store;

pub use memory::MemoryStore;
pub use object::{Object, ObjectMeta};
pub use selector::Selector;
pub use store::{Store, WatchEvent, WatchEventKind};
