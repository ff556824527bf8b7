mod batcher;
mod dataset;
mod masking;

pub use batcher::*;
pub use dataset::*;
pub use masking::*;
