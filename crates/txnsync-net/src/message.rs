//! Wire envelope for a transaction sync message: a one-byte version tag
//! followed by the fixed timing/request-param fields and the optional bloom
//! filter and transaction-group payloads. Mirrors the teacher's
//! one-byte-discriminant-plus-payload message framing, just without the
//! multiple message kinds this protocol doesn't need.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use txnsync_bloom::{BloomFilter, BloomFilterDescriptor, BloomFilterKind, TransactionsRange};
use txnsync_types::{GroupCounter, GroupTransactionId, RequestParams, Round, SignedTxGroup, TxnSyncError};

pub const WIRE_VERSION: u8 = 1;

/// Round-trip timing a peer reports back about our last sent message, used
/// to both confirm delivery and estimate bandwidth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimingParams {
    pub ref_txn_block_msg_seq: u64,
    pub response_elapsed_time: Duration,
    /// Sequence numbers the pool has accepted since the last message, drained
    /// from `Peer::take_accepted_messages`. Carried as a list on the wire
    /// (`AcceptedMsgSeq []uint64` in the source) since several outstanding
    /// sends can be acknowledged together.
    pub accepted_msg_seq: Vec<u64>,
    pub next_msg_min_delay: Duration,
}

/// A decoded incoming message paired with its on-wire size, held in a
/// peer's ordering heap until its sequence number comes due for delivery.
#[derive(Debug, Clone)]
pub struct IncomingEnvelope {
    pub message: SyncMessage,
    pub size: usize,
}

/// A fully decoded/ready-to-encode sync message.
#[derive(Debug, Clone)]
pub struct SyncMessage {
    pub sequence_number: u64,
    pub round: Round,
    pub request_params: Option<RequestParams>,
    pub bloom_filter: Option<BloomFilterDescriptor>,
    pub transaction_groups: Vec<SignedTxGroup>,
    pub timing: TimingParams,
}

fn put_duration(buf: &mut BytesMut, d: Duration) {
    buf.put_u64(d.as_nanos() as u64);
}

fn get_duration(buf: &mut impl Buf) -> Duration {
    Duration::from_nanos(buf.get_u64())
}

fn encode_group(out: &mut BytesMut, group: &SignedTxGroup) {
    out.put_slice(group.group_transaction_id.as_slice());
    out.put_u64(group.group_counter);
    out.put_u32(group.payload.len() as u32);
    out.put_slice(&group.payload);
}

fn decode_group(buf: &mut &[u8]) -> Result<SignedTxGroup, TxnSyncError> {
    if buf.len() < 40 {
        return Err(TxnSyncError::DecodingFailed);
    }
    let mut id_bytes = [0u8; 32];
    buf.copy_to_slice(&mut id_bytes);
    let group_counter: GroupCounter = buf.get_u64();
    if buf.remaining() < 4 {
        return Err(TxnSyncError::DecodingFailed);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(TxnSyncError::DecodingFailed);
    }
    let payload = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(SignedTxGroup { group_transaction_id: GroupTransactionId::from(id_bytes), group_counter, payload })
}

impl SyncMessage {
    pub fn encode(&self) -> Bytes {
        let mut head = BytesMut::new();
        head.put_u8(WIRE_VERSION);
        head.put_u64(self.sequence_number);
        head.put_u64(self.round.0);

        match self.request_params {
            Some(params) => {
                head.put_u8(1);
                head.put_u8(params.modulator);
                head.put_u8(params.offset);
            }
            None => head.put_u8(0),
        }

        match &self.bloom_filter {
            Some(descriptor) => {
                head.put_u8(1);
                head.put_u8(descriptor.kind as u8);
                head.put_u8(descriptor.params.modulator);
                head.put_u8(descriptor.params.offset);
                head.put_u8(descriptor.clear_previous as u8);
                head.put_u64(descriptor.contained_range.first_counter);
                head.put_u64(descriptor.contained_range.last_counter);
                head.put_u32(descriptor.encoded_bytes.len() as u32);
                head.put_slice(&descriptor.encoded_bytes);
            }
            None => head.put_u8(0),
        }

        put_duration(&mut head, self.timing.next_msg_min_delay);
        head.put_u64(self.timing.ref_txn_block_msg_seq);
        put_duration(&mut head, self.timing.response_elapsed_time);
        head.put_u32(self.timing.accepted_msg_seq.len() as u32);
        for seq in &self.timing.accepted_msg_seq {
            head.put_u64(*seq);
        }

        let mut groups_raw = BytesMut::new();
        for group in &self.transaction_groups {
            encode_group(&mut groups_raw, group);
        }
        let groups_frame = txnsync_codec::encode(&[groups_raw.freeze()]);
        head.put_u32(groups_frame.len() as u32);
        head.extend_from_slice(&groups_frame);

        head.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, TxnSyncError> {
        if buf.is_empty() {
            return Err(TxnSyncError::DecodingFailed);
        }
        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(TxnSyncError::UnsupportedVersion);
        }
        if buf.remaining() < 16 {
            return Err(TxnSyncError::DecodingFailed);
        }
        let sequence_number = buf.get_u64();
        let round = Round(buf.get_u64());

        if buf.remaining() < 1 {
            return Err(TxnSyncError::DecodingFailed);
        }
        let request_params = if buf.get_u8() != 0 {
            if buf.remaining() < 2 {
                return Err(TxnSyncError::DecodingFailed);
            }
            Some(RequestParams { modulator: buf.get_u8(), offset: buf.get_u8() })
        } else {
            None
        };

        if buf.remaining() < 1 {
            return Err(TxnSyncError::DecodingFailed);
        }
        let bloom_filter = if buf.get_u8() != 0 {
            if buf.remaining() < 19 {
                return Err(TxnSyncError::DecodingFailed);
            }
            let kind = BloomFilterKind::try_from(buf.get_u8()).map_err(|_| TxnSyncError::InvalidBloom)?;
            let params = RequestParams { modulator: buf.get_u8(), offset: buf.get_u8() };
            let clear_previous = buf.get_u8() != 0;
            let first_counter = buf.get_u64();
            let last_counter = buf.get_u64();
            if buf.remaining() < 4 {
                return Err(TxnSyncError::DecodingFailed);
            }
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(TxnSyncError::DecodingFailed);
            }
            let encoded_bytes = Bytes::copy_from_slice(&buf[..len]);
            buf.advance(len);
            Some(BloomFilterDescriptor { kind, params, contained_range: TransactionsRange::new(first_counter, last_counter), encoded_bytes, clear_previous })
        } else {
            None
        };

        if buf.remaining() < 24 {
            return Err(TxnSyncError::DecodingFailed);
        }
        let next_msg_min_delay = get_duration(&mut buf);
        let ref_txn_block_msg_seq = buf.get_u64();
        let response_elapsed_time = get_duration(&mut buf);
        if buf.remaining() < 4 {
            return Err(TxnSyncError::DecodingFailed);
        }
        let accepted_count = buf.get_u32() as usize;
        if buf.remaining() < accepted_count * 8 {
            return Err(TxnSyncError::DecodingFailed);
        }
        let mut accepted_msg_seq = Vec::with_capacity(accepted_count);
        for _ in 0..accepted_count {
            accepted_msg_seq.push(buf.get_u64());
        }

        if buf.remaining() < 4 {
            return Err(TxnSyncError::DecodingFailed);
        }
        let frame_len = buf.get_u32() as usize;
        if buf.remaining() < frame_len {
            return Err(TxnSyncError::DecodingFailed);
        }
        let frame = &buf[..frame_len];
        let decoded_frames = txnsync_codec::decode(frame).map_err(|_| TxnSyncError::DecodingFailed)?;
        let mut transaction_groups = Vec::new();
        if let Some(groups_raw) = decoded_frames.into_iter().next() {
            let mut cursor: &[u8] = &groups_raw;
            while !cursor.is_empty() {
                transaction_groups.push(decode_group(&mut cursor)?);
            }
        }

        Ok(SyncMessage {
            sequence_number,
            round,
            request_params,
            bloom_filter,
            transaction_groups,
            timing: TimingParams { ref_txn_block_msg_seq, response_elapsed_time, accepted_msg_seq, next_msg_min_delay },
        })
    }
}

/// Tests whether `filter` recognizes `id` as a member, decoding it first if
/// needed. Exists so call sites don't need to handle the decode error
/// explicitly when they've already validated the descriptor once.
pub fn filter_contains(filter: &BloomFilter, id_prefix: u64) -> bool {
    filter.test(id_prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(byte: u8, counter: u64) -> SignedTxGroup {
        SignedTxGroup::new(GroupTransactionId::repeat_byte(byte), counter, Bytes::from_static(b"payload"))
    }

    #[test]
    fn round_trips_minimal_message() {
        let msg = SyncMessage {
            sequence_number: 7,
            round: Round(42),
            request_params: Some(RequestParams::new(4, 1)),
            bloom_filter: None,
            transaction_groups: vec![group(1, 1), group(2, 2)],
            timing: TimingParams {
                ref_txn_block_msg_seq: 3,
                response_elapsed_time: Duration::from_millis(5),
                accepted_msg_seq: vec![1, 2],
                next_msg_min_delay: Duration::from_millis(100),
            },
        };
        let encoded = msg.encode();
        let decoded = SyncMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.sequence_number, 7);
        assert_eq!(decoded.round, Round(42));
        assert_eq!(decoded.request_params, Some(RequestParams::new(4, 1)));
        assert_eq!(decoded.transaction_groups.len(), 2);
        assert_eq!(decoded.transaction_groups[0].group_counter, 1);
        assert_eq!(decoded.timing.accepted_msg_seq, vec![1, 2]);
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut encoded = BytesMut::from(&b"\x99"[..]);
        encoded.put_u64(0);
        assert_eq!(SyncMessage::decode(&encoded).unwrap_err(), TxnSyncError::UnsupportedVersion);
    }
}
