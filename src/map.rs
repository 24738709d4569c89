//! Persistent, disk-backed map (open-addressed hash table).
//!
//! Three files live in the map's directory: `index.bin` (the hash table itself),
//! `keys.bin` and `values.bin` (chunked blob stores, see
//! [`crate::storage::mmap_file`]). Probing follows CPython's perturbed open-addressing
//! scheme; growth is triggered by a load-factor invariant and committed by building a
//! sibling index file and renaming it into place.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::config::Config;
use crate::dirutil;
use crate::error::{Error, Result};
use crate::scheme::MapScheme;
use crate::storage::mmap_file::MappedFile;

const INDEX_HEADER_SIZE: u64 = 24; // magic:8 + used:8 + mask:8
const ENTRY_SIZE: u64 = 24; // hash:8 + key_pos:8 + value_pos:8
const INDEX_FILE: &str = "index.bin";
const KEYS_FILE: &str = "keys.bin";
const VALUES_FILE: &str = "values.bin";

enum Lookup {
    Found(u64),
    Empty(u64),
}

struct Entry {
    hash: i64,
    key_pos: u64,
    value_pos: u64,
}

impl Entry {
    fn is_free(&self) -> bool {
        self.hash == 0 && self.key_pos == 0 && self.value_pos == 0
    }
}

/// A persistent map over an open-addressed hash table, parameterized by a
/// [`MapScheme`] that supplies encoding and hashing for its keys and values.
pub struct PersistentMap<S: MapScheme> {
    dir: PathBuf,
    index: MappedFile,
    keys: MappedFile,
    values: MappedFile,
    used: u64,
    mask: u64,
    sync_on_close: bool,
    _scheme: PhantomData<S>,
}

impl<S: MapScheme> PersistentMap<S> {
    /// Opens an existing map directory, or creates a new one if it does not exist.
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

        let mask = config.map.initial_buckets - 1;
        let index_size = INDEX_HEADER_SIZE + (mask + 1) * ENTRY_SIZE;
        let mut index = MappedFile::create(dirutil::join(&dir, INDEX_FILE), index_size)?;
        index.set_growth(config.growth.numerator, config.growth.denominator);
        index.seek(0)?;
        index.write(&crate::storage::mmap_file::MAGIC.to_le_bytes())?;
        index.write(&0u64.to_le_bytes())?; // used
        index.write(&mask.to_le_bytes())?; // mask
        index.zero_fill((mask + 1) * ENTRY_SIZE)?;

        let mut keys = MappedFile::create(dirutil::join(&dir, KEYS_FILE), config.map.initial_data_size)?;
        keys.set_growth(config.growth.numerator, config.growth.denominator);
        keys.write_magic()?;

        let mut values =
            MappedFile::create(dirutil::join(&dir, VALUES_FILE), config.map.initial_data_size)?;
        values.set_growth(config.growth.numerator, config.growth.denominator);
        values.write_magic()?;

        debug!(dir = %dir.display(), mask, "created persistent map");

        Ok(Self {
            dir,
            index,
            keys,
            values,
            used: 0,
            mask,
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
        let mask = u64::from_le_bytes(buf);

        let mut keys = MappedFile::open(dirutil::join(&dir, KEYS_FILE))?;
        keys.check_magic()?;
        keys.set_growth(config.growth.numerator, config.growth.denominator);
        keys.seek(keys.eof())?;

        let mut values = MappedFile::open(dirutil::join(&dir, VALUES_FILE))?;
        values.check_magic()?;
        values.set_growth(config.growth.numerator, config.growth.denominator);
        values.seek(values.eof())?;

        debug!(dir = %dir.display(), used, mask, "opened persistent map");

        Ok(Self {
            dir,
            index,
            keys,
            values,
            used,
            mask,
            sync_on_close: config.sync_on_close,
            _scheme: PhantomData,
        })
    }

    /// Number of keys currently stored.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.used
    }

    /// Returns true if the map holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Flushes all mapped regions to disk, truncates `keys.bin`/`values.bin` to their
    /// logical EOF, and releases the underlying file handles.
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
            self.keys.sync(0, self.keys.size())?;
            self.values.sync(0, self.values.size())?;
        }
        self.keys.truncate_to_eof()?;
        self.values.truncate_to_eof()?;
        Ok(())
    }

    fn entry_offset(slot: u64) -> u64 {
        INDEX_HEADER_SIZE + slot * ENTRY_SIZE
    }

    fn read_entry(&mut self, slot: u64) -> Result<Entry> {
        self.index.seek(Self::entry_offset(slot))?;
        let mut buf = [0u8; 8];
        self.index.read(&mut buf)?;
        let hash = i64::from_le_bytes(buf);
        self.index.read(&mut buf)?;
        let key_pos = u64::from_le_bytes(buf);
        self.index.read(&mut buf)?;
        let value_pos = u64::from_le_bytes(buf);
        Ok(Entry {
            hash,
            key_pos,
            value_pos,
        })
    }

    fn write_entry(&mut self, slot: u64, entry: &Entry) -> Result<()> {
        self.index.seek(Self::entry_offset(slot))?;
        self.index.write(&entry.hash.to_le_bytes())?;
        self.index.write(&entry.key_pos.to_le_bytes())?;
        self.index.write(&entry.value_pos.to_le_bytes())?;
        Ok(())
    }

    fn write_value_pos(&mut self, slot: u64, value_pos: u64) -> Result<()> {
        self.index.seek(Self::entry_offset(slot) + 16)?;
        self.index.write(&value_pos.to_le_bytes())
    }

    fn write_used(&mut self, used: u64) -> Result<()> {
        self.index.seek(8)?;
        self.index.write(&used.to_le_bytes())
    }

    /// Probes for `key`, returning the slot it occupies or the first free slot found on
    /// its probe path.
    fn lookup(&mut self, key: &S::Key) -> Result<Lookup> {
        let hash = S::hash_key(key);
        let uhash = hash as u64;
        let mut i = uhash & self.mask;
        let mut perturb = uhash;

        loop {
            let entry = self.read_entry(i)?;
            if entry.is_free() {
                return Ok(Lookup::Empty(i));
            }
            if entry.hash == hash {
                let bytes = self.keys.read_blob(entry.key_pos)?;
                let existing = S::decode_key(&bytes)?;
                if S::keys_equal(&existing, key) {
                    return Ok(Lookup::Found(i));
                }
            }
            perturb >>= 5;
            i = (i.wrapping_mul(5).wrapping_add(perturb).wrapping_add(1)) & self.mask;
        }
    }

    /// Looks up `key`, returning its decoded value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if no entry matches, or a codec error.
    pub fn get(&mut self, key: &S::Key) -> Result<S::Value> {
        match self.lookup(key)? {
            Lookup::Found(slot) => {
                let entry = self.read_entry(slot)?;
                let bytes = self.values.read_blob(entry.value_pos)?;
                S::decode_value(&bytes)
            }
            Lookup::Empty(_) => Err(Error::KeyNotFound),
        }
    }

    /// Returns true if `key` is present.
    ///
    /// # Errors
    ///
    /// Returns a codec error if decoding a probed key fails.
    pub fn contains_key(&mut self, key: &S::Key) -> Result<bool> {
        Ok(matches!(self.lookup(key)?, Lookup::Found(_)))
    }

    /// Inserts or updates the value associated with `key`.
    ///
    /// # Errors
    ///
    /// Returns a codec error, an allocator I/O error, or [`Error::Overflow`] if growing
    /// the index would overflow.
    pub fn set(&mut self, key: &S::Key, value: &S::Value) -> Result<()> {
        match self.lookup(key)? {
            Lookup::Found(slot) => {
                let entry = self.read_entry(slot)?;
                self.values.free(entry.value_pos)?;
                let encoded = S::encode_value(value)?;
                let value_pos = self.values.write_blob(&encoded)?;
                self.write_value_pos(slot, value_pos)?;
                Ok(())
            }
            Lookup::Empty(slot) => {
                let hash = S::hash_key(key);
                let encoded_key = S::encode_key(key)?;
                let key_pos = self.keys.write_blob(&encoded_key)?;

                let encoded_value = S::encode_value(value)?;
                let value_pos = self.values.write_blob(&encoded_value)?;

                self.write_entry(
                    slot,
                    &Entry {
                        hash,
                        key_pos,
                        value_pos,
                    },
                )?;
                self.used += 1;
                self.write_used(self.used)?;

                if 3 * self.used >= 2 * (self.mask + 1) {
                    self.rehash()?;
                }
                Ok(())
            }
        }
    }

    /// Doubles the table's bucket count, rebuilding it in a sibling file and
    /// atomically swapping it into place. Key and value offsets are preserved; only
    /// the index file changes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Overflow`] if the new mask would overflow, or an I/O error on
    /// rename failure.
    fn rehash(&mut self) -> Result<()> {
        let new_mask = (self.mask + 1)
            .checked_mul(2)
            .and_then(|v| v.checked_sub(1))
            .ok_or_else(|| Error::Overflow("index mask would overflow on rehash".to_string()))?;

        let sibling_path = dirutil::join(&self.dir, "index.bin.1");
        let new_size = INDEX_HEADER_SIZE + (new_mask + 1) * ENTRY_SIZE;
        let mut new_index = MappedFile::create(&sibling_path, new_size)?;
        new_index.seek(0)?;
        new_index.write(&crate::storage::mmap_file::MAGIC.to_le_bytes())?;
        new_index.write(&0u64.to_le_bytes())?;
        new_index.write(&new_mask.to_le_bytes())?;
        new_index.zero_fill((new_mask + 1) * ENTRY_SIZE)?;

        for slot in 0..=self.mask {
            let entry = self.read_entry(slot)?;
            if entry.is_free() {
                continue;
            }
            let uhash = entry.hash as u64;
            let mut i = uhash & new_mask;
            let mut perturb = uhash;
            loop {
                let off = INDEX_HEADER_SIZE + i * ENTRY_SIZE;
                new_index.seek(off)?;
                let mut buf = [0u8; 8];
                new_index.read(&mut buf)?;
                let h = i64::from_le_bytes(buf);
                new_index.read(&mut buf)?;
                let kp = u64::from_le_bytes(buf);
                new_index.read(&mut buf)?;
                let vp = u64::from_le_bytes(buf);
                if h == 0 && kp == 0 && vp == 0 {
                    new_index.seek(off)?;
                    new_index.write(&entry.hash.to_le_bytes())?;
                    new_index.write(&entry.key_pos.to_le_bytes())?;
                    new_index.write(&entry.value_pos.to_le_bytes())?;
                    break;
                }
                perturb >>= 5;
                i = (i.wrapping_mul(5).wrapping_add(perturb).wrapping_add(1)) & new_mask;
            }
        }
        new_index.seek(8)?;
        new_index.write(&self.used.to_le_bytes())?;

        let old_index_path = self.index.path().to_path_buf();
        let retired_path = dirutil::join(&self.dir, "index.bin.0");
        self.index.rename(&retired_path)?;
        new_index.rename(&old_index_path)?;

        self.index = new_index;
        self.mask = new_mask;
        std::fs::remove_file(&retired_path)?;

        trace!(new_mask, used = self.used, "map rehashed");
        Ok(())
    }

    /// Returns an iterator over `(key, value)` pairs. The iterator's range is fixed to
    /// the bucket count at construction time; mutating the map while iterating is
    /// unsupported.
    pub fn items(&mut self) -> MapItemsIter<'_, S> {
        MapItemsIter {
            map: self,
            pos: 0,
        }
    }

    /// Returns an iterator over keys.
    pub fn keys(&mut self) -> MapKeysIter<'_, S> {
        MapKeysIter {
            map: self,
            pos: 0,
        }
    }

    /// Returns an iterator over values.
    pub fn values(&mut self) -> MapValuesIter<'_, S> {
        MapValuesIter {
            map: self,
            pos: 0,
        }
    }

    fn max_pos(&self) -> u64 {
        self.mask + 1
    }
}

impl<S: MapScheme> Drop for PersistentMap<S> {
    fn drop(&mut self) {
        dirutil::mark_closed(&self.dir);
    }
}

/// Iterator over `(key, value)` pairs of a [`PersistentMap`].
pub struct MapItemsIter<'a, S: MapScheme> {
    map: &'a mut PersistentMap<S>,
    pos: u64,
}

impl<S: MapScheme> Iterator for MapItemsIter<'_, S> {
    type Item = Result<(S::Key, S::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        let max_pos = self.map.max_pos();
        while self.pos < max_pos {
            let slot = self.pos;
            self.pos += 1;
            let entry = match self.map.read_entry(slot) {
                Ok(e) => e,
                Err(e) => return Some(Err(e)),
            };
            if entry.is_free() {
                continue;
            }
            return Some((|| {
                let kbytes = self.map.keys.read_blob(entry.key_pos)?;
                let key = S::decode_key(&kbytes)?;
                let vbytes = self.map.values.read_blob(entry.value_pos)?;
                let value = S::decode_value(&vbytes)?;
                Ok((key, value))
            })());
        }
        None
    }
}

/// Iterator over keys of a [`PersistentMap`].
pub struct MapKeysIter<'a, S: MapScheme> {
    map: &'a mut PersistentMap<S>,
    pos: u64,
}

impl<S: MapScheme> Iterator for MapKeysIter<'_, S> {
    type Item = Result<S::Key>;

    fn next(&mut self) -> Option<Self::Item> {
        let max_pos = self.map.max_pos();
        while self.pos < max_pos {
            let slot = self.pos;
            self.pos += 1;
            let entry = match self.map.read_entry(slot) {
                Ok(e) => e,
                Err(e) => return Some(Err(e)),
            };
            if entry.is_free() {
                continue;
            }
            return Some((|| {
                let bytes = self.map.keys.read_blob(entry.key_pos)?;
                S::decode_key(&bytes)
            })());
        }
        None
    }
}

/// Iterator over values of a [`PersistentMap`].
pub struct MapValuesIter<'a, S: MapScheme> {
    map: &'a mut PersistentMap<S>,
    pos: u64,
}

impl<S: MapScheme> Iterator for MapValuesIter<'_, S> {
    type Item = Result<S::Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let max_pos = self.map.max_pos();
        while self.pos < max_pos {
            let slot = self.pos;
            self.pos += 1;
            let entry = match self.map.read_entry(slot) {
                Ok(e) => e,
                Err(e) => return Some(Err(e)),
            };
            if entry.is_free() {
                continue;
            }
            return Some((|| {
                let bytes = self.map.values.read_blob(entry.value_pos)?;
                S::decode_value(&bytes)
            })());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::BytesScheme;
    use tempfile::tempdir;

    fn kv(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let config = Config::defaults();
        let mut map = PersistentMap::<BytesScheme>::open(dir.path(), &config).unwrap();
        map.set(&kv("a"), &kv("1")).unwrap();
        map.set(&kv("b"), &kv("2")).unwrap();
        map.set(&kv("a"), &kv("3")).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&kv("a")).unwrap(), kv("3"));
        assert_eq!(map.get(&kv("b")).unwrap(), kv("2"));
    }

    #[test]
    fn missing_key_is_key_not_found() {
        let dir = tempdir().unwrap();
        let config = Config::defaults();
        let mut map = PersistentMap::<BytesScheme>::open(dir.path(), &config).unwrap();
        map.set(&kv("a"), &kv("1")).unwrap();
        let err = map.get(&kv("nope")).unwrap_err();
        assert!(matches!(err, Error::KeyNotFound));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempdir().unwrap();
        let config = Config::defaults();
        {
            let mut map = PersistentMap::<BytesScheme>::open(dir.path(), &config).unwrap();
            map.set(&kv("a"), &kv("1")).unwrap();
            map.set(&kv("b"), &kv("2")).unwrap();
            map.close().unwrap();
        }
        let mut map = PersistentMap::<BytesScheme>::open(dir.path(), &config).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&kv("a")).unwrap(), kv("1"));
        assert_eq!(map.get(&kv("b")).unwrap(), kv("2"));
    }

    #[test]
    fn rehash_preserves_all_keys() {
        let dir = tempdir().unwrap();
        let mut config = Config::defaults();
        config.map.initial_buckets = 16;
        let mut map = PersistentMap::<BytesScheme>::open(dir.path(), &config).unwrap();
        for i in 0..200u32 {
            map.set(&kv(&i.to_string()), &kv(&(i * 2).to_string())).unwrap();
        }
        assert_eq!(map.len(), 200);
        for i in 0..200u32 {
            assert_eq!(map.get(&kv(&i.to_string())).unwrap(), kv(&(i * 2).to_string()));
        }
        assert!(3 * map.len() < 2 * (map.mask + 1));
    }

    #[test]
    fn second_open_of_same_directory_fails_already_open() {
        let dir = tempdir().unwrap();
        let config = Config::defaults();
        let first = PersistentMap::<BytesScheme>::open(dir.path(), &config).unwrap();
        let err = PersistentMap::<BytesScheme>::open(dir.path(), &config).unwrap_err();
        assert!(matches!(err, Error::AlreadyOpen(_)));
        first.close().unwrap();
        // Dropped/closed handle releases the guard; a fresh open now succeeds.
        PersistentMap::<BytesScheme>::open(dir.path(), &config)
            .unwrap()
            .close()
            .unwrap();
    }

    #[test]
    fn items_iterator_visits_every_entry_exactly_once() {
        let dir = tempdir().unwrap();
        let config = Config::defaults();
        let mut map = PersistentMap::<BytesScheme>::open(dir.path(), &config).unwrap();
        for i in 0..10u32 {
            map.set(&kv(&i.to_string()), &kv(&i.to_string())).unwrap();
        }
        let mut seen: Vec<_> = map.items().map(|r| r.unwrap().0).collect();
        seen.sort();
        let mut expected: Vec<_> = (0..10u32).map(|i| kv(&i.to_string())).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }
}
