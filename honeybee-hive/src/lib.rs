//! The Honeybee hive: a per-binary control-flow index built offline so that
//! online Intel PT decoding reduces to table lookups.
//!
//! A hive maps (a) every executable byte of a binary to the id of the basic
//! block containing it (the *direct map*) and (b) every block id to the
//! id(s) and addresses of its successor(s) along the taken/not-taken edges
//! (the *block records*). Both tables are packed into a single flat file,
//! produced by [`write_hive_file`] and loaded with [`Hive::load`].

mod builder;
pub mod error;
mod extract;
mod format;

pub use crate::{
    builder::{write_hive, write_hive_file},
    error::HiveError,
    extract::{BasicBlock, BlockCategory, extract_blocks},
    format::{BlockRecord, CONDITIONAL_FLAG, HIVE_MAGIC, Hive, INDIRECT_INDEX},
};
