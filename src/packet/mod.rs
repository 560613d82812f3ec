//! Vessel-tracking packets as they flow through the archive.
//!
//! A [`PacketRecord`] is produced by the (external) decoder and never changes
//! afterwards. Its serialized form, [`PacketRecord::to_bytes`], is what gets
//! written into every partition and into spill files.

use std::fmt;

use bytes::Bytes;
use xxhash_rust::xxh3::xxh3_128;

use crate::encoding::{Decode, Encode, FieldReader, FieldWriter};
use crate::partition::SortKey;

/// Maritime Mobile Service Identity of a vessel.
pub type VesselId = u32;

const RECORD_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

impl Position {
    pub fn new(lat: f64, lon: f64) -> Self {
        Position { lat, lon }
    }
}

impl Encode for Position {
    fn encode(&self, w: &mut FieldWriter) {
        (self.lat, self.lon).encode(w)
    }
}

impl Decode for Position {
    fn decode(r: &mut FieldReader<'_>) -> anyhow::Result<Self> {
        let (lat, lon) = <(f64, f64)>::decode(r)?;
        Ok(Position { lat, lon })
    }
}

/// 128-bit digest of a raw payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ContentHash(pub u128);

impl ContentHash {
    pub const MIN: ContentHash = ContentHash(0);

    pub fn of(payload: &[u8]) -> Self {
        ContentHash(xxh3_128(payload))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PacketRecord {
    timestamp_millis: i64,
    raw_payload: Bytes,
    vessel_id: Option<VesselId>,
    position: Option<Position>,
    message_kind: Option<u8>,
    source_tag: String,
    content_hash: ContentHash,
}

impl PacketRecord {
    /// Creates a record for `raw_payload` received at `timestamp_millis`. The
    /// content hash is computed here, once.
    pub fn new(timestamp_millis: i64, raw_payload: impl Into<Bytes>) -> Self {
        let raw_payload = raw_payload.into();
        let content_hash = ContentHash::of(&raw_payload);
        PacketRecord {
            timestamp_millis,
            raw_payload,
            vessel_id: None,
            position: None,
            message_kind: None,
            source_tag: String::new(),
            content_hash,
        }
    }

    pub fn with_vessel(mut self, vessel_id: VesselId) -> Self {
        self.vessel_id = Some(vessel_id);
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_message_kind(mut self, kind: u8) -> Self {
        self.message_kind = Some(kind);
        self
    }

    pub fn with_source_tag(mut self, tag: impl Into<String>) -> Self {
        self.source_tag = tag.into();
        self
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp_millis
    }

    pub fn raw_payload(&self) -> &Bytes {
        &self.raw_payload
    }

    pub fn vessel_id(&self) -> Option<VesselId> {
        self.vessel_id
    }

    pub fn position(&self) -> Option<Position> {
        self.position
    }

    pub fn message_kind(&self) -> Option<u8> {
        self.message_kind
    }

    pub fn source_tag(&self) -> &str {
        &self.source_tag
    }

    pub fn content_hash(&self) -> ContentHash {
        self.content_hash
    }

    pub fn sort_key(&self) -> SortKey {
        SortKey::new(self.timestamp_millis, self.content_hash)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut w = FieldWriter::new();
        self.encode(&mut w);
        w.into_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> anyhow::Result<Self> {
        PacketRecord::decode(&mut FieldReader::new(buf))
    }
}

impl Encode for PacketRecord {
    fn encode(&self, w: &mut FieldWriter) {
        RECORD_VERSION.encode(w);
        self.timestamp_millis.encode(w);
        self.content_hash.0.encode(w);
        self.raw_payload.encode(w);
        self.vessel_id.encode(w);
        self.position.encode(w);
        self.message_kind.encode(w);
        self.source_tag.encode(w);
    }
}

impl Decode for PacketRecord {
    fn decode(r: &mut FieldReader<'_>) -> anyhow::Result<Self> {
        let version = u8::decode(r)?;
        if version != RECORD_VERSION {
            anyhow::bail!("unsupported record version {}", version);
        }
        Ok(PacketRecord {
            timestamp_millis: i64::decode(r)?,
            content_hash: ContentHash(u128::decode(r)?),
            raw_payload: Bytes::decode(r)?,
            vessel_id: Option::decode(r)?,
            position: Option::decode(r)?,
            message_kind: Option::decode(r)?,
            source_tag: String::decode(r)?,
        })
    }
}
