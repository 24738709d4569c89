//! # `emds`
//!
//! External-memory map and sequence containers backed by memory-mapped files.
//!
//! `emds` gives you two persistent, disk-backed collections that behave like ordinary
//! in-process containers but keep their entire contents memory-mapped on disk, for
//! working sets larger than RAM:
//!
//! - [`PersistentMap`]: an open-addressed hash table.
//! - [`PersistentSequence`]: a dense, append-oriented array.
//!
//! Both are built on a shared, within-file variable-size chunk allocator
//! ([`storage::mmap_file::MappedFile`]) and speak to a caller-supplied codec/hash
//! boundary ([`scheme`]) rather than any particular serialization format.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use emds::{Config, PersistentMap, scheme::BytesScheme};
//!
//! let config = Config::defaults();
//! let mut map = PersistentMap::<BytesScheme>::open("./data/my_map", &config)?;
//! map.set(&b"hello".to_vec(), &b"world".to_vec())?;
//! assert_eq!(map.get(&b"hello".to_vec())?, b"world".to_vec());
//! map.close()?;
//! ```
//!
//! ## Concurrency
//!
//! Containers are single-threaded and cooperative: a container instance is not
//! internally synchronized. Opening the same directory twice from within this process
//! while the first handle is still open fails with [`Error::AlreadyOpen`] — this is a
//! same-process guard only, not a cross-process lock: two separate processes must
//! still not open the same directory at once, since nothing here takes an OS-level file
//! lock. See the crate's design document for the full concurrency model.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod dirutil;
pub mod error;
pub mod map;
pub mod scheme;
pub mod sequence;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};
pub use map::PersistentMap;
pub use sequence::PersistentSequence;
