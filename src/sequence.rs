//! Persistent, disk-backed sequence (dense, append-oriented array).
//!
//! Two files live in the sequence's directory: `index.bin` (a dense array of value
//! offsets, prefixed by a header) and `values.bin` (a chunked blob store, see
//! [`crate::storage::mmap_file`]). Capacity grows geometrically (0, 1, 2, 4, 8, ...),
//! committed via the same sibling-file-then-rename-swap pattern the map uses for
//! rehash.
//!
//! Every slot in `0..used` always holds a real chunk offset: [`PersistentSequence::append`]
//! assigns one immediately before advancing `used`, and there is no `remove`, so the
//! "unassigned slot" case only arises for capacity beyond `used`, which indexed access
//! never reaches.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::config::Config;
use crate::dirutil;
use crate::error::{Error, Result};
use crate::scheme::SeqScheme;
use crate::storage::mmap_file::MappedFile;

const INDEX_HEADER_SIZE: u64 = 24; // magic:8 + used:8 + capacity:8
const ENTRY_SIZE: u64 = 8; // value_pos:8
const INDEX_FILE: &str = "index.bin";
const VALUES_FILE: &str = "values.bin";

/// A persistent, append-oriented sequence, parameterized by a [`SeqScheme`] that
/// supplies encoding for its element type.
pub struct PersistentSequence<S: SeqScheme> {
    dir: PathBuf,
    index: MappedFile,
    values: MappedFile,
    used: u64,
    capacity: u64,
    sync_on_close: bool,
    _scheme: PhantomData<S>,
}

impl<S: SeqScheme> PersistentSequence<S> {
    /// Opens an existing sequence directory, or creates a new one if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyOpen`] if this process already holds `dir` open via
    /// another `PersistentMap`/`PersistentSequence` handle, [`Error::OpenFailure`] if an
    /// existing directory's files have a bad magic constant, or [`Error::IoError`] on
    /// other I/O failure.
    pub fn open(dir: impl AsRef<Path>, config: &Config) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        dirutil::mark_open(&dir)?;
        let outcome = if dirutil::is_initialized(&dir, INDEX_FILE) {
            Self::open_existing(dir.clone(), config)
        } else {
            Self::create(dir.clone(), config)
        };
        if outcome.is_err() {
            dirutil::mark_closed(&dir);
        }
        outcome
    }

    fn create(dir: PathBuf, config: &Config) -> Result<Self> {
        dirutil::ensure_dir(&dir)?;

        let mut index = MappedFile::create(dirutil::join(&dir, INDEX_FILE), INDEX_HEADER_SIZE)?;
        index.set_growth(config.growth.numerator, config.growth.denominator);
        index.seek(0)?;
        index.write(&crate::storage::mmap_file::MAGIC.to_le_bytes())?;
        index.write(&0u64.to_le_bytes())?; // used
        index.write(&0u64.to_le_bytes())?; // capacity

        let mut values =
            MappedFile::create(dirutil::join(&dir, VALUES_FILE), config.sequence.initial_data_size)?;
        values.set_growth(config.growth.numerator, config.growth.denominator);
        values.write_magic()?;

        debug!(dir = %dir.display(), "created persistent sequence");

        Ok(Self {
            dir,
            index,
            values,
            used: 0,
            capacity: 0,
            sync_on_close: config.sync_on_close,
            _scheme: PhantomData,
        })
    }

    fn open_existing(dir: PathBuf, config: &Config) -> Result<Self> {
        let mut index = MappedFile::open(dirutil::join(&dir, INDEX_FILE))?;
        index.check_magic()?;
        index.set_growth(config.growth.numerator, config.growth.denominator);
        index.seek(8)?;
        let mut buf = [0u8; 8];
        index.read(&mut buf)?;
        let used = u64::from_le_bytes(buf);
        index.read(&mut buf)?;
        let capacity = u64::from_le_bytes(buf);

        let mut values = MappedFile::open(dirutil::join(&dir, VALUES_FILE))?;
        values.check_magic()?;
        values.set_growth(config.growth.numerator, config.growth.denominator);
        values.seek(values.eof())?;

        debug!(dir = %dir.display(), used, capacity, "opened persistent sequence");

        Ok(Self {
            dir,
            index,
            values,
            used,
            capacity,
            sync_on_close: config.sync_on_close,
            _scheme: PhantomData,
        })
    }

    /// Number of elements currently stored.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.used
    }

    /// Returns true if the sequence holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Flushes all mapped regions to disk, truncates `values.bin` to its logical EOF,
    /// and releases the underlying file handles.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoError`] if a flush or truncate fails.
    pub fn close(mut self) -> Result<()> {
        self.flush_and_truncate()
    }

    fn flush_and_truncate(&mut self) -> Result<()> {
        if self.sync_on_close {
            self.index.sync(0, self.index.size())?;
            self.values.sync(0, self.values.size())?;
        }
        self.values.truncate_to_eof()?;
        Ok(())
    }

    fn entry_offset(slot: u64) -> u64 {
        INDEX_HEADER_SIZE + slot * ENTRY_SIZE
    }

    fn read_value_pos(&mut self, slot: u64) -> Result<u64> {
        self.index.seek(Self::entry_offset(slot))?;
        let mut buf = [0u8; 8];
        self.index.read(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_value_pos(&mut self, slot: u64, value_pos: u64) -> Result<()> {
        self.index.seek(Self::entry_offset(slot))?;
        self.index.write(&value_pos.to_le_bytes())
    }

    fn write_used(&mut self, used: u64) -> Result<()> {
        self.index.seek(8)?;
        self.index.write(&used.to_le_bytes())
    }

    /// Resolves a possibly-negative index into a slot in `[0, used)`. Only [`Self::set`]
    /// uses this — [`Self::get`] rejects negative indices outright.
    fn resolve_index(&self, index: i64) -> Result<u64> {
        let used = self.used as i64;
        let resolved = if index < 0 { index + used } else { index };
        if resolved < 0 || resolved >= used {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.used,
            });
        }
        Ok(resolved as u64)
    }

    /// Appends `value` to the end of the sequence, growing capacity geometrically if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns a codec error, an allocator I/O error, or [`Error::Overflow`] if growing
    /// the index would overflow.
    pub fn append(&mut self, value: &S::Value) -> Result<()> {
        if self.used == self.capacity {
            self.grow()?;
        }
        let encoded = S::encode(value)?;
        let value_pos = self.values.write_blob(&encoded)?;
        self.write_value_pos(self.used, value_pos)?;
        self.used += 1;
        self.write_used(self.used)?;
        Ok(())
    }

    /// Doubles (or initializes to 1) the index's capacity, rebuilding it in a sibling
    /// file and atomically swapping it into place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Overflow`] if the new capacity would overflow.
    fn grow(&mut self) -> Result<()> {
        let new_capacity = if self.capacity == 0 { 1 } else { self.capacity * 2 };
        if new_capacity < self.capacity {
            return Err(Error::Overflow("sequence capacity would overflow".to_string()));
        }

        let sibling_path = dirutil::join(&self.dir, "index.bin.1");
        let new_size = INDEX_HEADER_SIZE + new_capacity * ENTRY_SIZE;
        let mut new_index = MappedFile::create(&sibling_path, new_size)?;
        new_index.seek(0)?;
        new_index.write(&crate::storage::mmap_file::MAGIC.to_le_bytes())?;
        new_index.write(&self.used.to_le_bytes())?;
        new_index.write(&new_capacity.to_le_bytes())?;

        for slot in 0..self.capacity {
            let value_pos = self.read_value_pos(slot)?;
            new_index.seek(INDEX_HEADER_SIZE + slot * ENTRY_SIZE)?;
            new_index.write(&value_pos.to_le_bytes())?;
        }
        new_index.zero_fill((new_capacity - self.capacity) * ENTRY_SIZE)?;

        let old_index_path = self.index.path().to_path_buf();
        let retired_path = dirutil::join(&self.dir, "index.bin.0");
        self.index.rename(&retired_path)?;
        new_index.rename(&old_index_path)?;

        self.index = new_index;
        self.capacity = new_capacity;
        std::fs::remove_file(&retired_path)?;

        trace!(new_capacity, "sequence index grown");
        Ok(())
    }

    /// Reads the element at `index`. Unlike [`Self::set`], `get` does not accept
    /// negative indices — only `0 <= index < len()` is valid.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `index` is out of bounds.
    pub fn get(&mut self, index: i64) -> Result<S::Value> {
        if index < 0 || index as u64 >= self.used {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.used,
            });
        }
        let value_pos = self.read_value_pos(index as u64)?;
        let bytes = self.values.read_blob(value_pos)?;
        S::decode(&bytes)
    }

    /// Replaces the element at `index`. Negative indices count from the end.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexOutOfRange`] if `index` is out of bounds.
    pub fn set(&mut self, index: i64, value: &S::Value) -> Result<()> {
        let slot = self.resolve_index(index)?;
        let old_value_pos = self.read_value_pos(slot)?;
        if old_value_pos != 0 {
            self.values.free(old_value_pos)?;
        }
        let encoded = S::encode(value)?;
        let value_pos = self.values.write_blob(&encoded)?;
        self.write_value_pos(slot, value_pos)
    }

    /// Returns an iterator over elements in order, over the length fixed at
    /// construction time.
    pub fn iter(&mut self) -> SequenceIter<'_, S> {
        let len = self.used;
        SequenceIter {
            seq: self,
            pos: 0,
            len,
        }
    }
}

impl<S: SeqScheme> Drop for PersistentSequence<S> {
    fn drop(&mut self) {
        dirutil::mark_closed(&self.dir);
    }
}

/// Iterator over the elements of a [`PersistentSequence`].
pub struct SequenceIter<'a, S: SeqScheme> {
    seq: &'a mut PersistentSequence<S>,
    pos: u64,
    len: u64,
}

impl<S: SeqScheme> Iterator for SequenceIter<'_, S> {
    type Item = Result<S::Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.len {
            return None;
        }
        let idx = self.pos as i64;
        self.pos += 1;
        Some(self.seq.get(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::BytesScheme;
    use tempfile::tempdir;

    fn v(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[test]
    fn append_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let config = Config::defaults();
        let mut seq = PersistentSequence::<BytesScheme>::open(dir.path(), &config).unwrap();
        seq.append(&v("a")).unwrap();
        seq.append(&v("b")).unwrap();
        seq.append(&v("c")).unwrap();
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.get(0).unwrap(), v("a"));
        assert_eq!(seq.get(2).unwrap(), v("c"));
    }

    #[test]
    fn capacity_grows_geometrically() {
        let dir = tempdir().unwrap();
        let config = Config::defaults();
        let mut seq = PersistentSequence::<BytesScheme>::open(dir.path(), &config).unwrap();
        let expected_caps = [1u64, 2, 4, 4, 8];
        for expected in expected_caps {
            seq.append(&v("x")).unwrap();
            assert_eq!(seq.capacity, expected);
        }
    }

    #[test]
    fn get_rejects_negative_indices() {
        let dir = tempdir().unwrap();
        let config = Config::defaults();
        let mut seq = PersistentSequence::<BytesScheme>::open(dir.path(), &config).unwrap();
        seq.append(&v("a")).unwrap();
        seq.append(&v("b")).unwrap();
        let err = seq.get(-1).unwrap_err();
        assert!(matches!(err, Error::IndexOutOfRange { index: -1, len: 2 }));
    }

    #[test]
    fn negative_index_set_targets_end() {
        let dir = tempdir().unwrap();
        let config = Config::defaults();
        let mut seq = PersistentSequence::<BytesScheme>::open(dir.path(), &config).unwrap();
        seq.append(&v("a")).unwrap();
        seq.append(&v("b")).unwrap();
        seq.append(&v("c")).unwrap();
        seq.set(-1, &v("C")).unwrap();
        assert_eq!(seq.get(2).unwrap(), v("C"));

        let err = seq.set(-4, &v("X")).unwrap_err();
        assert!(matches!(err, Error::IndexOutOfRange { .. }));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        let config = Config::defaults();
        {
            let mut seq = PersistentSequence::<BytesScheme>::open(dir.path(), &config).unwrap();
            seq.append(&v("a")).unwrap();
            seq.append(&v("b")).unwrap();
            seq.close().unwrap();
        }
        let mut seq = PersistentSequence::<BytesScheme>::open(dir.path(), &config).unwrap();
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.get(0).unwrap(), v("a"));
        assert_eq!(seq.get(1).unwrap(), v("b"));
    }

    #[test]
    fn second_open_of_same_directory_fails_already_open() {
        let dir = tempdir().unwrap();
        let config = Config::defaults();
        let first = PersistentSequence::<BytesScheme>::open(dir.path(), &config).unwrap();
        let err = PersistentSequence::<BytesScheme>::open(dir.path(), &config).unwrap_err();
        assert!(matches!(err, Error::AlreadyOpen(_)));
        first.close().unwrap();
        PersistentSequence::<BytesScheme>::open(dir.path(), &config)
            .unwrap()
            .close()
            .unwrap();
    }

    #[test]
    fn iterator_visits_elements_in_order() {
        let dir = tempdir().unwrap();
        let config = Config::defaults();
        let mut seq = PersistentSequence::<BytesScheme>::open(dir.path(), &config).unwrap();
        for i in 0..5u32 {
            seq.append(&v(&i.to_string())).unwrap();
        }
        let collected: Vec<_> = seq.iter().map(|r| r.unwrap()).collect();
        assert_eq!(
            collected,
            (0..5u32).map(|i| v(&i.to_string())).collect::<Vec<_>>()
        );
    }
}
