//! UDP data-fragment codec.
//!
//! # Wire layout (fixed 1452 bytes, big-endian)
//!
//! ```text
//! [0..8]    len         u64  declared frame payload length
//! [8..16]   width       u64  frame width in pixels
//! [16..24]  height      u64  frame height in pixels
//! [24..32]  ts_sec      i64  capture timestamp, seconds
//! [32..40]  ts_usec     i64  capture timestamp, microseconds
//! [40..44]  msg_total   i32  total fragments for this frame
//! [44..48]  msg_number  i32  0-based index of this fragment
//! [48..52]  msg_len     i32  valid payload bytes in this fragment
//! [52..]    buf         [u8; 1400]  payload (tail padded)
//! ```
//!
//! The full 1452 bytes are transmitted regardless of `msg_len` so the
//! receiver can always read one fixed-size datagram and validate in place.

use bytes::{Buf, BufMut};
use framelink_core::{Frame, FrameMeta, PixelFormat, Timestamp, TransportError};

/// Fixed payload capacity of one fragment.
pub const CHUNK_SIZE: usize = 1400;
/// Header bytes preceding the payload.
pub const HEADER_SIZE: usize = 52;
/// Total on-wire size of every fragment datagram.
pub const FRAGMENT_WIRE_SIZE: usize = HEADER_SIZE + CHUNK_SIZE;

/// One UDP-sized chunk of a larger frame. Ephemeral — constructed and
/// sent/received once, never persisted.
#[derive(Clone)]
pub struct Fragment {
    pub len: u64,
    pub width: u64,
    pub height: u64,
    pub timestamp: Timestamp,
    pub msg_total: i32,
    pub msg_number: i32,
    pub msg_len: i32,
    pub payload: [u8; CHUNK_SIZE],
}

impl std::fmt::Debug for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fragment")
            .field("len", &self.len)
            .field("timestamp", &self.timestamp)
            .field("msg_number", &self.msg_number)
            .field("msg_total", &self.msg_total)
            .field("msg_len", &self.msg_len)
            .finish_non_exhaustive()
    }
}

impl Fragment {
    /// Build the fragment for one chunk of a frame.
    ///
    /// `chunk` must be at most [`CHUNK_SIZE`] bytes; the tail of the payload
    /// buffer is zero-padded.
    pub fn for_chunk(meta: &FrameMeta, msg_total: i32, msg_number: i32, chunk: &[u8]) -> Self {
        debug_assert!(chunk.len() <= CHUNK_SIZE);
        let mut payload = [0u8; CHUNK_SIZE];
        payload[..chunk.len()].copy_from_slice(chunk);
        Self {
            len: meta.len as u64,
            width: meta.width as u64,
            height: meta.height as u64,
            timestamp: meta.timestamp,
            msg_total,
            msg_number,
            msg_len: chunk.len() as i32,
            payload,
        }
    }

    /// Split `frame` into its on-wire fragments, index order.
    pub fn packetize(frame: &Frame) -> Vec<Fragment> {
        let data = frame.payload();
        let total = data.len().div_ceil(CHUNK_SIZE).max(1) as i32;
        (0..total)
            .map(|i| {
                let offset = i as usize * CHUNK_SIZE;
                let end = (offset + CHUNK_SIZE).min(data.len());
                Self::for_chunk(&frame.meta, total, i, &data[offset..end])
            })
            .collect()
    }

    /// Serialize into the fixed wire layout.
    pub fn encode(&self) -> [u8; FRAGMENT_WIRE_SIZE] {
        let mut wire = [0u8; FRAGMENT_WIRE_SIZE];
        let mut b = &mut wire[..];
        b.put_u64(self.len);
        b.put_u64(self.width);
        b.put_u64(self.height);
        b.put_i64(self.timestamp.sec);
        b.put_i64(self.timestamp.usec);
        b.put_i32(self.msg_total);
        b.put_i32(self.msg_number);
        b.put_i32(self.msg_len);
        b.put_slice(&self.payload);
        wire
    }

    /// Parse one received datagram. The datagram must be exactly
    /// [`FRAGMENT_WIRE_SIZE`] bytes.
    pub fn decode(wire: &[u8]) -> Result<Self, TransportError> {
        if wire.len() != FRAGMENT_WIRE_SIZE {
            return Err(TransportError::ShortDatagram {
                len: wire.len(),
                expected: FRAGMENT_WIRE_SIZE,
            });
        }
        let mut b = wire;
        let len = b.get_u64();
        let width = b.get_u64();
        let height = b.get_u64();
        let timestamp = Timestamp::new(b.get_i64(), b.get_i64());
        let msg_total = b.get_i32();
        let msg_number = b.get_i32();
        let msg_len = b.get_i32();

        if msg_total <= 0 || msg_number < 0 || msg_number >= msg_total {
            return Err(TransportError::FragmentOutOfRange {
                index: msg_number,
                total: msg_total,
            });
        }
        if msg_len < 0 || msg_len as usize > CHUNK_SIZE {
            return Err(TransportError::FragmentOutOfRange {
                index: msg_len,
                total: CHUNK_SIZE as i32,
            });
        }

        let mut payload = [0u8; CHUNK_SIZE];
        payload.copy_from_slice(b);
        Ok(Self {
            len,
            width,
            height,
            timestamp,
            msg_total,
            msg_number,
            msg_len,
            payload,
        })
    }

    /// Valid payload bytes of this fragment.
    pub fn chunk(&self) -> &[u8] {
        &self.payload[..self.msg_len as usize]
    }

    /// Frame metadata carried by this fragment's header.
    pub fn frame_meta(&self, format: PixelFormat) -> FrameMeta {
        FrameMeta {
            len: self.len as usize,
            width: self.width as u32,
            height: self.height as u32,
            format,
            timestamp: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_core::Frame;

    fn meta(len: usize, ts: Timestamp) -> FrameMeta {
        FrameMeta {
            len,
            width: 640,
            height: 480,
            format: PixelFormat::Yuyv,
            timestamp: ts,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let frag = Fragment::for_chunk(&meta(3000, Timestamp::new(7, 42)), 3, 1, &[0xAB; 1400]);
        let wire = frag.encode();
        assert_eq!(wire.len(), FRAGMENT_WIRE_SIZE);

        let back = Fragment::decode(&wire).expect("valid fragment");
        assert_eq!(back.len, 3000);
        assert_eq!(back.width, 640);
        assert_eq!(back.timestamp, Timestamp::new(7, 42));
        assert_eq!(back.msg_total, 3);
        assert_eq!(back.msg_number, 1);
        assert_eq!(back.chunk(), &[0xAB; 1400][..]);
    }

    #[test]
    fn short_datagram_rejected() {
        let frag = Fragment::for_chunk(&meta(100, Timestamp::ZERO), 1, 0, &[1, 2, 3]);
        let wire = frag.encode();
        assert!(matches!(
            Fragment::decode(&wire[..100]),
            Err(TransportError::ShortDatagram { len: 100, .. })
        ));
    }

    #[test]
    fn out_of_range_index_rejected() {
        let mut frag = Fragment::for_chunk(&meta(100, Timestamp::ZERO), 2, 0, &[0; 10]);
        frag.msg_number = 5;
        assert!(matches!(
            Fragment::decode(&frag.encode()),
            Err(TransportError::FragmentOutOfRange { index: 5, total: 2 })
        ));
    }

    #[test]
    fn packetize_splits_in_index_order() {
        let mut frame = Frame::scratch(4000, PixelFormat::Yuyv);
        frame.meta = meta(3500, Timestamp::new(1, 0));
        for (i, b) in frame.data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        let frags = Fragment::packetize(&frame);
        assert_eq!(frags.len(), 3);
        assert_eq!(frags[0].msg_len as usize, CHUNK_SIZE);
        assert_eq!(frags[2].msg_len as usize, 3500 - 2 * CHUNK_SIZE);

        // Concatenated chunks reproduce the original payload
        let mut out = Vec::new();
        for f in &frags {
            assert_eq!(f.msg_total, 3);
            out.extend_from_slice(f.chunk());
        }
        assert_eq!(out, frame.payload());
    }

    #[test]
    fn empty_frame_still_yields_one_fragment() {
        let frame = Frame::scratch(0, PixelFormat::Yuyv);
        let frags = Fragment::packetize(&frame);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].msg_len, 0);
    }
}
