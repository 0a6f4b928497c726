//! Fragmentation and reassembly
//!
//! Messages larger than a transport's MTU split into equal-size fragments
//! (last one short). Reassembly is keyed by (sender, message id), tolerates
//! any arrival order, and drops partials whose deadline passes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use lib_crypto::PublicKey;

use crate::error::WireError;
use crate::frame::{Frame, MIN_FRAGMENT_SIZE};

/// Default lifetime of an incomplete reassembly
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on concurrently reassembling messages
pub const DEFAULT_MAX_PARTIALS: usize = 256;

/// Split a payload into fragments of `fragment_size` bytes; the last may be
/// shorter. An exactly-MTU payload yields one fragment, and so does an empty
/// one.
pub fn split_payload(payload: &[u8], fragment_size: usize) -> Result<Vec<Vec<u8>>, WireError> {
    if fragment_size < MIN_FRAGMENT_SIZE {
        return Err(WireError::FragmentSizeTooSmall(fragment_size));
    }

    if payload.len() <= fragment_size {
        return Ok(vec![payload.to_vec()]);
    }

    let count = payload.len().div_ceil(fragment_size);
    if count > u16::MAX as usize {
        return Err(WireError::TooManyFragments(count));
    }

    Ok(payload
        .chunks(fragment_size)
        .map(|chunk| chunk.to_vec())
        .collect())
}

type MessageKey = (PublicKey, [u8; 16]);

struct Partial {
    fragments: Vec<Option<Vec<u8>>>,
    received: u16,
    deadline: Instant,
}

/// Buffer of in-flight multi-fragment messages
pub struct ReassemblyBuffer {
    pending: HashMap<MessageKey, Partial>,
    timeout: Duration,
    max_partials: usize,
}

impl ReassemblyBuffer {
    pub fn new(timeout: Duration, max_partials: usize) -> Self {
        ReassemblyBuffer {
            pending: HashMap::new(),
            timeout,
            max_partials,
        }
    }

    /// Accept one fragment. Returns the fully reassembled payload when this
    /// fragment completes its message, `None` while the message is still
    /// partial or the fragment is a duplicate.
    pub fn insert(&mut self, frame: &Frame, now: Instant) -> Result<Option<Vec<u8>>, WireError> {
        let index = frame.header.fragment_index;
        let count = frame.header.fragment_count;
        if count == 0 || index >= count {
            return Err(WireError::BadFragment { index, count });
        }

        // Single-fragment messages bypass the buffer entirely
        if count == 1 {
            return Ok(Some(frame.payload.clone()));
        }

        let key = (frame.header.sender_id, frame.header.message_id);
        match self.pending.get(&key) {
            None if self.pending.len() >= self.max_partials => {
                return Err(WireError::ReassemblyFull);
            }
            // A sender that changes its mind about the count mid-message is
            // malformed; drop the whole partial.
            Some(existing) if existing.fragments.len() != count as usize => {
                self.pending.remove(&key);
                return Err(WireError::BadFragment { index, count });
            }
            _ => {}
        }

        let partial = self.pending.entry(key).or_insert_with(|| Partial {
            fragments: vec![None; count as usize],
            received: 0,
            deadline: now + self.timeout,
        });

        let slot = &mut partial.fragments[index as usize];
        if slot.is_some() {
            return Ok(None); // duplicate fragment
        }
        *slot = Some(frame.payload.clone());
        partial.received += 1;
        let complete = partial.received == count;

        if complete {
            let partial = self.pending.remove(&key).unwrap();
            let mut payload = Vec::new();
            for fragment in partial.fragments {
                payload.extend_from_slice(&fragment.unwrap());
            }
            return Ok(Some(payload));
        }

        Ok(None)
    }

    /// Drop partials whose deadline has passed; returns how many messages
    /// were abandoned.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, partial| partial.deadline > now);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(dropped, "reassembly deadline sweep");
        }
        dropped
    }

    /// Number of messages currently reassembling
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for ReassemblyBuffer {
    fn default() -> Self {
        ReassemblyBuffer::new(DEFAULT_REASSEMBLY_TIMEOUT, DEFAULT_MAX_PARTIALS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameHeader, FrameType, DEFAULT_TTL, PROTOCOL_VERSION};
    use anyhow::Result;
    use lib_crypto::KeyPair;

    fn fragment_frames(payload: &[u8], size: usize) -> Result<Vec<Frame>> {
        let kp = KeyPair::from_seed(&[3u8; 32])?;
        let chunks = split_payload(payload, size)?;
        let count = chunks.len() as u16;
        let frames = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut frame = Frame::unsigned(
                    FrameHeader {
                        version: PROTOCOL_VERSION,
                        frame_type: FrameType::FileChunk,
                        ttl: DEFAULT_TTL,
                        flags: 0,
                        timestamp_ms: 0,
                        sender_id: kp.public,
                        message_id: [0x55; 16],
                        fragment_index: i as u16,
                        fragment_count: count,
                        payload_len: chunk.len() as u32,
                    },
                    chunk,
                );
                frame.sign_with(&kp);
                frame
            })
            .collect();
        Ok(frames)
    }

    #[test]
    fn test_exact_mtu_is_one_fragment() -> Result<()> {
        let chunks = split_payload(&vec![7u8; 4096], 4096)?;
        assert_eq!(chunks.len(), 1);
        Ok(())
    }

    #[test]
    fn test_split_sizes() -> Result<()> {
        let chunks = split_payload(&vec![7u8; 10_000], 4096)?;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 4096);
        assert_eq!(chunks[2].len(), 10_000 - 2 * 4096);
        Ok(())
    }

    #[test]
    fn test_floor_enforced() {
        assert!(matches!(
            split_payload(b"x", 100),
            Err(WireError::FragmentSizeTooSmall(100))
        ));
    }

    #[test]
    fn test_reassembly_in_order() -> Result<()> {
        let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let frames = fragment_frames(&payload, 4096)?;
        let mut buffer = ReassemblyBuffer::default();
        let now = Instant::now();

        let mut result = None;
        for frame in &frames {
            result = buffer.insert(frame, now)?;
        }
        assert_eq!(result.unwrap(), payload);
        assert!(buffer.is_empty());
        Ok(())
    }

    #[test]
    fn test_reassembly_out_of_order() -> Result<()> {
        let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let mut frames = fragment_frames(&payload, 4096)?;
        frames.reverse();
        let mut buffer = ReassemblyBuffer::default();
        let now = Instant::now();

        let mut result = None;
        for frame in &frames {
            result = buffer.insert(frame, now)?;
        }
        assert_eq!(result.unwrap(), payload);
        Ok(())
    }

    #[test]
    fn test_duplicate_fragment_ignored() -> Result<()> {
        let payload = vec![1u8; 10_000];
        let frames = fragment_frames(&payload, 4096)?;
        let mut buffer = ReassemblyBuffer::default();
        let now = Instant::now();

        assert!(buffer.insert(&frames[0], now)?.is_none());
        assert!(buffer.insert(&frames[0], now)?.is_none());
        assert!(buffer.insert(&frames[1], now)?.is_none());
        let done = buffer.insert(&frames[2], now)?;
        assert_eq!(done.unwrap(), payload);
        Ok(())
    }

    #[test]
    fn test_deadline_sweep_drops_partial() -> Result<()> {
        let frames = fragment_frames(&vec![1u8; 10_000], 4096)?;
        let mut buffer = ReassemblyBuffer::new(Duration::from_secs(30), 8);
        let now = Instant::now();

        buffer.insert(&frames[0], now)?;
        assert_eq!(buffer.len(), 1);

        assert_eq!(buffer.sweep(now + Duration::from_secs(31)), 1);
        assert!(buffer.is_empty());

        // Late fragment restarts from scratch and never completes alone
        assert!(buffer
            .insert(&frames[1], now + Duration::from_secs(32))?
            .is_none());
        Ok(())
    }

    #[test]
    fn test_capacity_bound() -> Result<()> {
        let mut buffer = ReassemblyBuffer::new(Duration::from_secs(30), 1);
        let now = Instant::now();

        let frames_a = fragment_frames(&vec![1u8; 10_000], 4096)?;
        buffer.insert(&frames_a[0], now)?;

        // Second message from a different id hits the cap
        let kp = KeyPair::from_seed(&[8u8; 32])?;
        let mut other = frames_a[0].clone();
        other.header.sender_id = kp.public;
        other.sign_with(&kp);
        assert_eq!(buffer.insert(&other, now), Err(WireError::ReassemblyFull));
        Ok(())
    }
}
