//! Built-in intent handlers installed by the node.

pub mod system;

pub use system::{register_system_handlers, BootState, BootStatus};
