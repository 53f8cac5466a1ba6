pub mod error;
pub mod utils;
pub mod logging;
pub mod cli;
pub mod config;
pub mod grid;
pub mod source;
pub mod spatial_index;
pub mod factors;
pub mod mapper;
pub mod time_bounds;
pub mod records;
pub mod hooks;
pub mod catalog;
pub mod transformer;
pub mod assembler;
pub mod aggregation;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_utils;
