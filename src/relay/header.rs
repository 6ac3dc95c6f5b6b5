//! Committed Header Chain Model
//!
//! The on-chain relay stores, per block, an 80-byte Bitcoin header plus the
//! metadata needed for fork choice and difficulty validation. The client
//! mirrors that state transition (`compute_next`) so it can project the
//! relay's tip locally while batching submissions, without waiting for
//! confirmations between transactions.

use bitcoin::block::Header;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::pow::Work;
use borsh::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};
use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Blocks per difficulty adjustment epoch
pub const DIFF_ADJUSTMENT_INTERVAL: u32 = 2016;

/// Previous block timestamps carried for median-time-past validation
pub const PREV_TIMESTAMP_COUNT: usize = 10;

/// Serialized length of one Bitcoin header
pub const RAW_HEADER_LEN: usize = 80;

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("header after height {height} does not connect: expected prev {expected}, got {actual}")]
    BrokenLink {
        height: u32,
        expected: String,
        actual: String,
    },

    #[error("malformed raw header: {0}")]
    Malformed(String),

    #[error("expected exactly {expected} previous timestamps, got {actual}")]
    BadTimestampCount { expected: usize, actual: usize },
}

/// One header as committed by the relay: the raw header plus fork-choice
/// and difficulty metadata.
///
/// The borsh encoding is the on-chain wire format; its SHA-256 digest is the
/// commitment the relay keeps in its ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredHeader {
    pub header: Header,
    /// Accumulated proof of work, big-endian 256-bit
    pub chain_work: [u8; 32],
    pub block_height: u32,
    /// Timestamp of the first block of the current difficulty epoch
    pub last_diff_adjustment: u32,
    /// Timestamps of the previous blocks, oldest first
    pub prev_timestamps: [u32; PREV_TIMESTAMP_COUNT],
}

impl StoredHeader {
    /// Seed entry for relay initialization.
    ///
    /// `prev_timestamps` must hold exactly the 10 timestamps preceding
    /// `header`, oldest first; chain work starts at the seed header's own
    /// contribution.
    pub fn seed(
        header: Header,
        block_height: u32,
        last_diff_adjustment: u32,
        prev_timestamps: &[u32],
    ) -> Result<Self, HeaderError> {
        let prev_timestamps: [u32; PREV_TIMESTAMP_COUNT] =
            prev_timestamps
                .try_into()
                .map_err(|_| HeaderError::BadTimestampCount {
                    expected: PREV_TIMESTAMP_COUNT,
                    actual: prev_timestamps.len(),
                })?;
        Ok(Self {
            header,
            chain_work: header.work().to_be_bytes(),
            block_height,
            last_diff_adjustment,
            prev_timestamps,
        })
    }

    /// Accumulated work as a comparable 256-bit quantity
    pub fn work(&self) -> Work {
        Work::from_be_bytes(self.chain_work)
    }

    pub fn timestamp(&self) -> u32 {
        self.header.time
    }

    /// Block hash in internal byte order
    pub fn block_hash_internal(&self) -> [u8; 32] {
        use bitcoin::hashes::Hash;
        self.header.block_hash().to_byte_array()
    }

    /// The relay's commitment for this entry: SHA-256 of the wire encoding
    pub fn commit_hash(&self) -> [u8; 32] {
        let bytes = borsh::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.finalize().into()
    }

    /// Apply the next header to this entry.
    ///
    /// Pure transition mirroring the on-chain relay: verifies linkage,
    /// accumulates work, rotates the timestamp ring, and rolls the
    /// difficulty epoch on 2016-block boundaries. PoW and target validation
    /// stay on chain; the client only needs the metadata to plan with.
    pub fn compute_next(&self, next: Header) -> Result<StoredHeader, HeaderError> {
        if next.prev_blockhash != self.header.block_hash() {
            return Err(HeaderError::BrokenLink {
                height: self.block_height,
                expected: self.header.block_hash().to_string(),
                actual: next.prev_blockhash.to_string(),
            });
        }

        let block_height = self.block_height + 1;
        let total = self.work() + next.work();

        let mut prev_timestamps = [0u32; PREV_TIMESTAMP_COUNT];
        prev_timestamps[..PREV_TIMESTAMP_COUNT - 1]
            .copy_from_slice(&self.prev_timestamps[1..]);
        prev_timestamps[PREV_TIMESTAMP_COUNT - 1] = self.header.time;

        let last_diff_adjustment = if block_height % DIFF_ADJUSTMENT_INTERVAL == 0 {
            next.time
        } else {
            self.last_diff_adjustment
        };

        Ok(StoredHeader {
            header: next,
            chain_work: total.to_be_bytes(),
            block_height,
            last_diff_adjustment,
            prev_timestamps,
        })
    }
}

impl BorshSerialize for StoredHeader {
    fn serialize<W: Write>(&self, writer: &mut W) -> IoResult<()> {
        writer.write_all(&serialize(&self.header))?;
        BorshSerialize::serialize(&self.chain_work, writer)?;
        BorshSerialize::serialize(&self.block_height, writer)?;
        BorshSerialize::serialize(&self.last_diff_adjustment, writer)?;
        BorshSerialize::serialize(&self.prev_timestamps, writer)?;
        Ok(())
    }
}

impl BorshDeserialize for StoredHeader {
    fn deserialize_reader<R: Read>(reader: &mut R) -> IoResult<Self> {
        let mut raw = [0u8; RAW_HEADER_LEN];
        reader.read_exact(&mut raw)?;
        let header: Header = deserialize(&raw)
            .map_err(|e| IoError::new(ErrorKind::InvalidData, e.to_string()))?;
        Ok(Self {
            header,
            chain_work: BorshDeserialize::deserialize_reader(reader)?,
            block_height: BorshDeserialize::deserialize_reader(reader)?,
            last_diff_adjustment: BorshDeserialize::deserialize_reader(reader)?,
            prev_timestamps: BorshDeserialize::deserialize_reader(reader)?,
        })
    }
}

/// Apply `headers` in order starting from `from`, returning every projected
/// entry (one per header).
pub fn compute_chain(
    from: &StoredHeader,
    headers: &[Header],
) -> Result<Vec<StoredHeader>, HeaderError> {
    let mut computed = Vec::with_capacity(headers.len());
    let mut current = *from;
    for header in headers {
        current = current.compute_next(*header)?;
        computed.push(current);
    }
    Ok(computed)
}

/// Parse an 80-byte header from raw bytes
pub fn parse_raw_header(bytes: &[u8]) -> Result<Header, HeaderError> {
    if bytes.len() != RAW_HEADER_LEN {
        return Err(HeaderError::Malformed(format!(
            "expected {} bytes, got {}",
            RAW_HEADER_LEN,
            bytes.len()
        )));
    }
    deserialize(bytes).map_err(|e| HeaderError::Malformed(e.to_string()))
}

/// Serialize a header to its 80-byte consensus form
pub fn header_bytes(header: &Header) -> [u8; RAW_HEADER_LEN] {
    let bytes = serialize(header);
    let mut out = [0u8; RAW_HEADER_LEN];
    out.copy_from_slice(&bytes);
    out
}


#[cfg(test)]
mod tests {
    use super::testutil::{linked_chain, linked_header};
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::BlockHash;

    const BITS: u32 = 0x1d00_ffff;
    const T0: u32 = 1_600_000_000;

    fn seed_at_100000() -> StoredHeader {
        let header = linked_header(BlockHash::all_zeros(), T0, BITS, 42);
        let timestamps: Vec<u32> = (0..10).map(|i| T0 - 9 + i).collect();
        StoredHeader::seed(header, 100_000, T0, &timestamps).unwrap()
    }

    #[test]
    fn test_seed_requires_ten_timestamps() {
        let header = linked_header(BlockHash::all_zeros(), T0, BITS, 0);
        let err = StoredHeader::seed(header, 1, T0, &[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            HeaderError::BadTimestampCount {
                expected: 10,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_five_headers_on_height_100000() {
        let seed = seed_at_100000();
        let headers = linked_chain(&seed.header, 5, BITS, T0);

        let computed = compute_chain(&seed, &headers).unwrap();
        assert_eq!(computed.len(), 5);
        assert_eq!(computed.last().unwrap().block_height, 100_005);

        // Work strictly increases along the chain, seed included.
        let mut all = vec![seed];
        all.extend(computed);
        for pair in all.windows(2) {
            assert!(pair[1].work() > pair[0].work());
        }
    }

    #[test]
    fn test_chain_work_is_sum_of_contributions() {
        let seed = seed_at_100000();
        let headers = linked_chain(&seed.header, 3, BITS, T0);
        let computed = compute_chain(&seed, &headers).unwrap();

        let mut expected = seed.work();
        for header in &headers {
            expected = expected + header.work();
        }
        assert_eq!(computed.last().unwrap().work(), expected);
    }

    #[test]
    fn test_harder_target_contributes_more_work() {
        let easy = linked_header(BlockHash::all_zeros(), T0, 0x1d00_ffff, 0);
        let hard = linked_header(BlockHash::all_zeros(), T0, 0x1c00_ffff, 0);
        assert!(hard.work() > easy.work());
    }

    #[test]
    fn test_broken_link_rejected() {
        let seed = seed_at_100000();
        let stranger = linked_header(BlockHash::all_zeros(), T0 + 600, BITS, 7);
        let err = seed.compute_next(stranger).unwrap_err();
        assert!(matches!(err, HeaderError::BrokenLink { height: 100_000, .. }));
    }

    #[test]
    fn test_timestamp_ring_rotates() {
        let seed = seed_at_100000();
        let next = linked_chain(&seed.header, 1, BITS, T0)[0];
        let computed = seed.compute_next(next).unwrap();

        assert_eq!(computed.prev_timestamps[9], seed.header.time);
        assert_eq!(computed.prev_timestamps[..9], seed.prev_timestamps[1..]);
    }

    #[test]
    fn test_epoch_rollover_updates_adjustment_timestamp() {
        let header = linked_header(BlockHash::all_zeros(), T0, BITS, 0);
        let seed = StoredHeader::seed(header, 2015, T0 - 1000, &[T0; 10]).unwrap();

        let next = linked_chain(&seed.header, 1, BITS, T0)[0];
        let computed = seed.compute_next(next).unwrap();
        assert_eq!(computed.block_height, 2016);
        assert_eq!(computed.last_diff_adjustment, next.time);

        // A non-boundary step keeps the epoch timestamp.
        let further = linked_chain(&computed.header, 1, BITS, next.time)[0];
        let after = computed.compute_next(further).unwrap();
        assert_eq!(after.last_diff_adjustment, computed.last_diff_adjustment);
    }

    #[test]
    fn test_wire_round_trip_and_commit_determinism() {
        let seed = seed_at_100000();
        let bytes = borsh::to_vec(&seed).unwrap();
        assert_eq!(bytes.len(), RAW_HEADER_LEN + 32 + 4 + 4 + 40);

        let back = StoredHeader::try_from_slice(&bytes).unwrap();
        assert_eq!(back, seed);
        assert_eq!(back.commit_hash(), seed.commit_hash());

        let mut other = seed;
        other.block_height += 1;
        assert_ne!(other.commit_hash(), seed.commit_hash());
    }

    #[test]
    fn test_raw_header_round_trip() {
        let header = linked_header(BlockHash::all_zeros(), T0, BITS, 123);
        let bytes = header_bytes(&header);
        assert_eq!(parse_raw_header(&bytes).unwrap(), header);
        assert!(parse_raw_header(&bytes[..79]).is_err());
    }
}
