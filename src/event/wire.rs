// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Big-endian record codecs for the gossip wire protocol.
//!
//! Every multi-byte integer is big-endian. Absent parents are written as a
//! zeroed hash and a zero generation; presence is derived from
//! `creator_seq == 0` (self) and `other_id < 0` (other).

use super::{
    from_epoch_parts, Event, EventData, EventHash, SystemTxKind, Transaction, NO_OTHER_PARENT,
    NO_PARENT_GEN,
};
use crate::error::{Error, Result};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ed25519_dalek::Signature;

// Caps on wire-declared counts, to bound allocation on malformed input.
const MAX_TIPS: usize = 1 << 20;
const MAX_MEMBERS: usize = 1 << 16;
const MAX_TXS_PER_EVENT: usize = 1 << 20;
const MAX_TX_BYTES: usize = 1 << 26;
const MAX_BITMAP_BYTES: usize = MAX_TIPS / 8 + 1;

const FLAG_SYSTEM: u8 = 0x01;

fn ensure(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        Err(Error::TruncatedRecord(needed - buf.remaining()))
    } else {
        Ok(())
    }
}

pub(crate) fn write_transaction(buf: &mut BytesMut, tx: &Transaction) {
    let flags = if tx.is_system() { FLAG_SYSTEM } else { 0 };
    buf.put_u8(flags);
    let payload = tx.payload();
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    if let Transaction::System { kind, .. } = tx {
        buf.put_u8(*kind as u8);
    }
}

pub(crate) fn read_transaction(buf: &mut Bytes) -> Result<Transaction> {
    ensure(buf, 5)?;
    let flags = buf.get_u8();
    let len = buf.get_u32() as usize;
    if len > MAX_TX_BYTES {
        return Err(Error::MalformedEvent(format!(
            "transaction of {len} bytes exceeds the wire cap"
        )));
    }
    ensure(buf, len)?;
    let payload = buf.split_to(len);
    if flags & FLAG_SYSTEM == 0 {
        return Ok(Transaction::User(payload));
    }
    ensure(buf, 1)?;
    let octet = buf.get_u8();
    let kind = SystemTxKind::from_octet(octet)
        .ok_or_else(|| Error::MalformedEvent(format!("unknown system subtype {octet:#04x}")))?;
    Ok(Transaction::System { kind, payload })
}

pub(crate) fn write_event(buf: &mut BytesMut, event: &Event) {
    let data = event.data();
    buf.put_u64(data.creator_id);
    buf.put_u64(data.creator_seq);
    buf.put_i64(data.other_id);
    buf.put_i64(data.other_seq);
    buf.put_u64(data.self_parent_gen.max(0) as u64);
    buf.put_u64(data.other_parent_gen.max(0) as u64);
    buf.put_slice(&data.self_parent_hash.unwrap_or(EventHash::ZERO).0);
    buf.put_slice(&data.other_parent_hash.unwrap_or(EventHash::ZERO).0);
    let (secs, nanos) = super::epoch_parts(data.time_created);
    buf.put_i64(secs);
    buf.put_i32(nanos);
    buf.put_u32(data.transactions.len() as u32);
    for tx in &data.transactions {
        write_transaction(buf, tx);
    }
    let sig = event.signature().to_bytes();
    buf.put_u16(sig.len() as u16);
    buf.put_slice(&sig);
}

pub(crate) fn read_event(mut buf: Bytes) -> Result<Event> {
    ensure(&buf, 8 + 8 + 8 + 8 + 8 + 8 + 32 + 32 + 8 + 4 + 4)?;
    let creator_id = buf.get_u64();
    let creator_seq = buf.get_u64();
    let other_id = buf.get_i64();
    let other_seq = buf.get_i64();
    let self_gen = buf.get_u64();
    let other_gen = buf.get_u64();
    let mut self_hash = [0u8; EventHash::SIZE];
    buf.copy_to_slice(&mut self_hash);
    let mut other_hash = [0u8; EventHash::SIZE];
    buf.copy_to_slice(&mut other_hash);
    let secs = buf.get_i64();
    let nanos = buf.get_i32();
    let tx_count = buf.get_u32() as usize;
    if tx_count > MAX_TXS_PER_EVENT {
        return Err(Error::MalformedEvent(format!(
            "{tx_count} transactions exceeds the wire cap"
        )));
    }
    let mut transactions = Vec::with_capacity(tx_count);
    for _ in 0..tx_count {
        transactions.push(read_transaction(&mut buf)?);
    }
    ensure(&buf, 2)?;
    let sig_len = buf.get_u16() as usize;
    ensure(&buf, sig_len)?;
    let sig_bytes = buf.split_to(sig_len);
    let signature = Signature::try_from(&sig_bytes[..])
        .map_err(|_| Error::MalformedEvent(format!("signature of {sig_len} bytes")))?;

    let (self_parent_hash, self_parent_gen) = if creator_seq == 0 {
        if self_hash != EventHash::ZERO.0 {
            return Err(Error::MalformedEvent(
                "self-parent hash declared at sequence zero".to_string(),
            ));
        }
        (None, NO_PARENT_GEN)
    } else {
        (Some(EventHash(self_hash)), self_gen as i64)
    };
    let (other_parent_hash, other_parent_gen) = if other_id < 0 {
        if other_hash != EventHash::ZERO.0 {
            return Err(Error::MalformedEvent(
                "other-parent hash declared without an other-parent".to_string(),
            ));
        }
        (None, NO_PARENT_GEN)
    } else {
        (Some(EventHash(other_hash)), other_gen as i64)
    };

    let data = EventData {
        creator_id,
        creator_seq,
        other_id: if other_id < 0 { NO_OTHER_PARENT } else { other_id },
        other_seq,
        self_parent_hash,
        other_parent_hash,
        self_parent_gen,
        other_parent_gen,
        time_created: from_epoch_parts(secs, nanos),
        transactions,
    };
    Ok(Event::from_parts(data, signature))
}

/// One entry of the phase 1 tip list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TipRecord {
    pub(crate) has_parent: bool,
    pub(crate) hash: EventHash,
    pub(crate) generation: u64,
}

pub(crate) fn write_tips(buf: &mut BytesMut, tips: &[TipRecord]) {
    buf.put_u32(tips.len() as u32);
    for tip in tips {
        buf.put_u8(tip.has_parent as u8);
        buf.put_slice(&tip.hash.0);
        buf.put_u64(tip.generation);
    }
}

pub(crate) fn read_tips(mut buf: Bytes) -> Result<Vec<TipRecord>> {
    ensure(&buf, 4)?;
    let count = buf.get_u32() as usize;
    if count > MAX_TIPS {
        return Err(Error::FrameTooLarge(count, MAX_TIPS));
    }
    let mut tips = Vec::with_capacity(count);
    for _ in 0..count {
        ensure(&buf, 1 + EventHash::SIZE + 8)?;
        let has_parent = buf.get_u8() != 0;
        let mut hash = [0u8; EventHash::SIZE];
        buf.copy_to_slice(&mut hash);
        let generation = buf.get_u64();
        tips.push(TipRecord {
            has_parent,
            hash: EventHash(hash),
            generation,
        });
    }
    Ok(tips)
}

pub(crate) fn write_min_gens(buf: &mut BytesMut, gens: &[u64]) {
    buf.put_u32(gens.len() as u32);
    for gen in gens {
        buf.put_u64(*gen);
    }
}

pub(crate) fn read_min_gens(mut buf: Bytes) -> Result<Vec<u64>> {
    ensure(&buf, 4)?;
    let count = buf.get_u32() as usize;
    if count > MAX_MEMBERS {
        return Err(Error::FrameTooLarge(count, MAX_MEMBERS));
    }
    ensure(&buf, count * 8)?;
    Ok((0..count).map(|_| buf.get_u64()).collect())
}

pub(crate) fn write_bitmap(buf: &mut BytesMut, bits: &[bool]) {
    let byte_len = (bits.len() + 7) / 8;
    buf.put_u32(byte_len as u32);
    let mut bytes = vec![0u8; byte_len];
    for (ix, bit) in bits.iter().enumerate() {
        if *bit {
            bytes[ix / 8] |= 1 << (ix % 8);
        }
    }
    buf.put_slice(&bytes);
}

/// Unpacks LSB-first; the caller truncates to the tip count it sent.
pub(crate) fn read_bitmap(mut buf: Bytes) -> Result<Vec<bool>> {
    ensure(&buf, 4)?;
    let byte_len = buf.get_u32() as usize;
    if byte_len > MAX_BITMAP_BYTES {
        return Err(Error::FrameTooLarge(byte_len, MAX_BITMAP_BYTES));
    }
    ensure(&buf, byte_len)?;
    let mut bits = Vec::with_capacity(byte_len * 8);
    for _ in 0..byte_len {
        let byte = buf.get_u8();
        for shift in 0..8 {
            bits.push(byte & (1 << shift) != 0);
        }
    }
    Ok(bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_utils::EventBuilder;
    use ed25519_dalek::Keypair;
    use rand::rngs::OsRng;

    fn sample_event() -> Event {
        let mut builder = EventBuilder::new(2, Keypair::generate(&mut OsRng));
        let _ = builder.next_with_payload(b"first");
        builder.next(
            Some((3, 7, EventHash([9; 32]), 4)),
            vec![
                Transaction::User(Bytes::from_static(b"user payload")),
                Transaction::System {
                    kind: SystemTxKind::StateSig,
                    payload: Bytes::from_static(b"sig payload"),
                },
            ],
        )
    }

    #[test]
    fn event_round_trip() {
        let event = sample_event();
        let mut buf = BytesMut::new();
        write_event(&mut buf, &event);
        let decoded = read_event(buf.freeze()).expect("decodes");
        assert_eq!(decoded.hash(), event.hash());
        assert_eq!(decoded.generation(), event.generation());
        assert_eq!(decoded.transactions(), event.transactions());
        assert_eq!(decoded.creator_seq(), event.creator_seq());
    }

    #[test]
    fn truncated_event_is_rejected() {
        let event = sample_event();
        let mut buf = BytesMut::new();
        write_event(&mut buf, &event);
        let full = buf.freeze();
        let cut = full.slice(..full.len() - 3);
        assert!(matches!(
            read_event(cut),
            Err(Error::TruncatedRecord(_)) | Err(Error::MalformedEvent(_))
        ));
    }

    #[test]
    fn orphan_with_parent_hash_is_rejected() {
        let event = sample_event();
        let mut buf = BytesMut::new();
        write_event(&mut buf, &event);
        let mut bytes = buf.to_vec();
        // force creator_seq to zero while the self-parent hash stays set
        for byte in bytes.iter_mut().take(16).skip(8) {
            *byte = 0;
        }
        assert!(matches!(
            read_event(Bytes::from(bytes)),
            Err(Error::MalformedEvent(_))
        ));
    }

    #[test]
    fn tips_round_trip() {
        let tips = vec![
            TipRecord {
                has_parent: false,
                hash: EventHash([1; 32]),
                generation: 0,
            },
            TipRecord {
                has_parent: true,
                hash: EventHash([2; 32]),
                generation: 17,
            },
        ];
        let mut buf = BytesMut::new();
        write_tips(&mut buf, &tips);
        assert_eq!(read_tips(buf.freeze()).expect("decodes"), tips);
    }

    #[test]
    fn bitmap_round_trip_preserves_prefix() {
        let bits = vec![true, false, false, true, true, false, true, false, true];
        let mut buf = BytesMut::new();
        write_bitmap(&mut buf, &bits);
        let decoded = read_bitmap(buf.freeze()).expect("decodes");
        assert_eq!(&decoded[..bits.len()], &bits[..]);
        // padding bits are zero
        assert!(decoded[bits.len()..].iter().all(|b| !b));
    }

    #[test]
    fn min_gens_round_trip() {
        let gens = vec![0u64, 3, 42, u64::MAX];
        let mut buf = BytesMut::new();
        write_min_gens(&mut buf, &gens);
        assert_eq!(read_min_gens(buf.freeze()).expect("decodes"), gens);
    }
}
