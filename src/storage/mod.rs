//! Storage layer: a within-file variable-size chunk allocator over memory-mapped
//! files, plus the in-memory free-chunk tree that backs it.
//!
//! # Module Structure
//!
//! - [`mmap_file`]: memory-mapped file with chunk allocate/free (`MappedFile`)
//! - [`free_tree`]: size-ordered free-chunk tree (`FreeTree`)

pub mod free_tree;
pub mod mmap_file;

pub use free_tree::{FreeTree, Hole};
pub use mmap_file::{align, hole_size, MappedFile, MAGIC, WORD};
