mod digests;
mod errors;

pub mod blockservice;
pub mod blockstore;
pub mod fixtures;
pub mod forest;
pub mod proto;
pub mod sync;
pub mod transform;

// #[template] expands to paths below the crate root.
#[cfg(test)]
#[allow(clippy::single_component_path_imports)]
use rstest_reuse;

pub use digests::{BlockId, BLOCK_ID_LEN};
pub use errors::Error;
