//! Test helpers shared across Crunchy crates.

pub mod runtime;
pub mod terminal;

pub use runtime::{FakeRuntime, RuntimeCall};
pub use terminal::FakeTerminal;
