pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{content_block, seeded_bytes};
