//! # Snapshot Codec
//!
//! Deterministic binary encoding of the world state, plus a checked
//! envelope used for recovery and replica verification.
//!
//! ## State Layout (little-endian)
//!
//! ```text
//! u32 next_id | u32 n_free | u32 free[n_free]
//! u32 n_archetypes
//!   per archetype, in ID order:
//!     u32 n_words | u64 words[n_words]        component bitmap
//!     u32 n_entities | u32 entities[n_entities] row order
//!     u32 n_columns
//!       per column, ascending component ID:
//!         u32 name_len | name | u32 blob_len | blob
//! ```
//!
//! Column blobs hold one serialized value per row. Integers are written
//! as integer literals, so values above 2^53 survive.
//!
//! ## Envelope
//!
//! ```text
//! "MRDN" | u32 version | u64 tick_height | u64 epoch_height | u64 timestamp_ms
//!        | [u8; 16] state_hash | u64 state_len | state | u32 crc32
//! ```

use std::fmt;
use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use siphasher::sip128::{Hasher128, SipHasher24};

use crate::ecs::archetype::Archetype;
use crate::ecs::bitmap::Bitmap;
use crate::ecs::column::AnyColumn;
use crate::ecs::component::ComponentId;
use crate::ecs::entity::{EntityAllocator, EntityId};
use crate::ecs::world_state::WorldState;
use crate::error::SnapshotError;

const SNAPSHOT_MAGIC: &[u8; 4] = b"MRDN";

/// Current envelope format version.
pub const SNAPSHOT_VERSION: u32 = 1;

const HASH_KEY_0: u64 = 0x6d65_7269_6469_616e;
const HASH_KEY_1: u64 = 0x7368_6172_6473_7461;

/// 128-bit hash of a serialized world state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StateHash(pub [u8; 16]);

impl StateHash {
    /// SipHash-2-4 of `bytes` under the fixed keys.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = SipHasher24::new_with_keys(HASH_KEY_0, HASH_KEY_1);
        hasher.write(bytes);
        Self(hasher.finish128().as_bytes())
    }

    /// Raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateHash({self})")
    }
}

/// Bounds-checked little-endian cursor.
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) const fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], SnapshotError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(SnapshotError::Truncated(self.pos))?;
        let chunk = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(chunk)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], SnapshotError> {
        let mut raw = [0u8; N];
        raw.copy_from_slice(self.take(N)?);
        Ok(raw)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, SnapshotError> {
        self.array().map(u32::from_le_bytes)
    }

    pub(crate) fn u64(&mut self) -> Result<u64, SnapshotError> {
        self.array().map(u64::from_le_bytes)
    }

    /// A `u32` count, capped by the bytes left so corrupt input cannot
    /// force a huge allocation.
    fn count(&mut self, min_item_size: usize) -> Result<usize, SnapshotError> {
        let n = self.u32()? as usize;
        if n.saturating_mul(min_item_size) > self.remaining() {
            return Err(SnapshotError::Truncated(self.pos));
        }
        Ok(n)
    }

    fn prefixed(&mut self) -> Result<&'a [u8], SnapshotError> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

fn put_len(out: &mut Vec<u8>, len: usize, what: &str) -> Result<(), SnapshotError> {
    let len = u32::try_from(len).map_err(|_| SnapshotError::Encode {
        name: what.to_string(),
        reason: "length exceeds u32".to_string(),
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

/// Serializes a world state.
///
/// # Errors
///
/// Fails if a component value cannot be serialized.
pub fn encode_state(state: &WorldState) -> Result<Vec<u8>, SnapshotError> {
    let mut out = Vec::new();
    let allocator = state.allocator();
    out.extend_from_slice(&allocator.next_id().to_le_bytes());
    put_len(&mut out, allocator.free_ids().len(), "free list")?;
    for id in allocator.free_ids() {
        out.extend_from_slice(&id.get().to_le_bytes());
    }

    put_len(&mut out, state.archetypes().len(), "archetypes")?;
    for archetype in state.archetypes() {
        let words = archetype.components().words();
        put_len(&mut out, words.len(), "bitmap")?;
        for word in words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        put_len(&mut out, archetype.len(), "entities")?;
        for entity in archetype.entities() {
            out.extend_from_slice(&entity.get().to_le_bytes());
        }
        put_len(&mut out, archetype.columns().len(), "columns")?;
        let mut blob = Vec::new();
        for column in archetype.columns() {
            let name = column.name();
            put_len(&mut out, name.len(), name)?;
            out.extend_from_slice(name.as_bytes());
            blob.clear();
            column.encode(&mut blob)?;
            put_len(&mut out, blob.len(), name)?;
            out.extend_from_slice(&blob);
        }
    }
    Ok(out)
}

/// Replaces `state`'s entities and archetypes with decoded data.
///
/// The registry is kept; every column must name a registered component.
/// On error `state` is unchanged.
///
/// # Errors
///
/// Fails on truncated or malformed input, unknown components, or data that
/// breaks a storage invariant.
pub fn decode_state(state: &mut WorldState, bytes: &[u8]) -> Result<(), SnapshotError> {
    let mut reader = ByteReader::new(bytes);
    let next_id = reader.u32()?;
    let n_free = reader.count(4)?;
    let mut free = Vec::with_capacity(n_free);
    for _ in 0..n_free {
        free.push(EntityId::new(reader.u32()?));
    }
    let allocator = EntityAllocator::from_parts(next_id, free).map_err(SnapshotError::Corrupt)?;

    let n_archetypes = reader.count(12)?;
    let mut archetypes = Vec::with_capacity(n_archetypes);
    for id in 0..n_archetypes {
        archetypes.push(decode_archetype(state, &mut reader, id)?);
    }
    if reader.remaining() != 0 {
        return Err(SnapshotError::Corrupt(format!(
            "{} trailing bytes after archetype {}",
            reader.remaining(),
            n_archetypes.saturating_sub(1)
        )));
    }

    state
        .replace_storage(allocator, archetypes)
        .map_err(SnapshotError::Corrupt)
}

fn decode_archetype(
    state: &WorldState,
    reader: &mut ByteReader<'_>,
    id: usize,
) -> Result<Archetype, SnapshotError> {
    let n_words = reader.count(8)?;
    let mut words = Vec::with_capacity(n_words);
    for _ in 0..n_words {
        words.push(reader.u64()?);
    }
    let stored = Bitmap::from_words(words);

    let n_entities = reader.count(4)?;
    let mut entities = Vec::with_capacity(n_entities);
    for _ in 0..n_entities {
        entities.push(EntityId::new(reader.u32()?));
    }

    let n_columns = reader.count(8)?;
    let mut columns: Vec<(ComponentId, Box<dyn AnyColumn>)> = Vec::with_capacity(n_columns);
    for _ in 0..n_columns {
        let name = std::str::from_utf8(reader.prefixed()?)
            .map_err(|_| SnapshotError::Corrupt(format!("archetype {id}: column name is not UTF-8")))?;
        let blob = reader.prefixed()?;
        let registry = state.registry();
        let component = registry
            .id_of(name)
            .ok_or_else(|| SnapshotError::UnknownComponent(name.to_string()))?;
        let mut column = registry
            .new_column(component)
            .ok_or_else(|| SnapshotError::UnknownComponent(name.to_string()))?;
        column.decode(blob)?;
        columns.push((component, column));
    }

    // The bitmap is rebuilt from this process's component IDs
    let rebuilt: Bitmap = columns.iter().map(|(component, _)| *component).collect();
    if rebuilt != stored || rebuilt.count() != columns.len() {
        return Err(SnapshotError::Corrupt(format!(
            "archetype {id}: component bitmap does not match its columns"
        )));
    }
    columns.sort_by_key(|(component, _)| *component);
    let columns = columns.into_iter().map(|(_, column)| column).collect();

    Archetype::restore(id, stored, columns, entities).map_err(SnapshotError::Corrupt)
}

/// A serialized world state with its heights and hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    /// Ticks completed when the snapshot was taken.
    pub tick_height: u64,
    /// Epochs completed when the snapshot was taken.
    pub epoch_height: u64,
    /// Wall-clock time of the last tick, in milliseconds.
    pub timestamp_ms: u64,
    /// Hash of `state`.
    pub state_hash: StateHash,
    /// Output of [`encode_state`].
    pub state: Vec<u8>,
}

impl Snapshot {
    /// Wraps serialized state, computing its hash.
    #[must_use]
    pub fn new(tick_height: u64, epoch_height: u64, timestamp_ms: u64, state: Vec<u8>) -> Self {
        Self {
            tick_height,
            epoch_height,
            timestamp_ms,
            state_hash: StateHash::of(&state),
            state,
        }
    }

    /// Encodes the envelope.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 4 + 24 + 16 + 8 + self.state.len() + 4);
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out.extend_from_slice(&self.tick_height.to_le_bytes());
        out.extend_from_slice(&self.epoch_height.to_le_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        out.extend_from_slice(&self.state_hash.0);
        out.extend_from_slice(&(self.state.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.state);
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decodes and verifies an envelope.
    ///
    /// # Errors
    ///
    /// Fails on bad magic, unknown version, truncation, CRC mismatch or a
    /// state blob that does not match its recorded hash.
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        if bytes.len() < 4 {
            return Err(SnapshotError::Truncated(0));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let mut reader = ByteReader::new(body);
        if reader.take(4)? != SNAPSHOT_MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let version = reader.u32()?;
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        let mut expected = [0u8; 4];
        expected.copy_from_slice(trailer);
        let expected = u32::from_le_bytes(expected);
        let computed = crc32fast::hash(body);
        if expected != computed {
            return Err(SnapshotError::ChecksumMismatch { expected, computed });
        }

        let tick_height = reader.u64()?;
        let epoch_height = reader.u64()?;
        let timestamp_ms = reader.u64()?;
        let mut hash = [0u8; 16];
        hash.copy_from_slice(reader.take(16)?);
        let state_len = usize::try_from(reader.u64()?).map_err(|_| SnapshotError::Truncated(reader.position()))?;
        let state = reader.take(state_len)?.to_vec();
        if reader.remaining() != 0 {
            return Err(SnapshotError::Corrupt(format!(
                "{} trailing bytes in envelope",
                reader.remaining()
            )));
        }

        let state_hash = StateHash(hash);
        if StateHash::of(&state) != state_hash {
            return Err(SnapshotError::HashMismatch);
        }
        Ok(Self {
            tick_height,
            epoch_height,
            timestamp_ms,
            state_hash,
            state,
        })
    }
}
