//! Frame producers for the send-side data protocol.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use framelink_core::{Frame, TransportError};

use crate::reassembly::ReassemblyBuffer;

/// Producer callback driven by [`DataProtocol::run_send`].
///
/// Single-pass, non-blocking contract: implementations must return promptly —
/// `Ok(false)` when no frame is ready — so the run loop can keep observing
/// its enable flag.
///
/// [`DataProtocol::run_send`]: crate::data::DataProtocol::run_send
#[async_trait]
pub trait FrameSource: Send {
    /// Fill `scratch` with the next frame. Returns `Ok(true)` when a frame
    /// was produced.
    async fn next_frame(&mut self, scratch: &mut Frame) -> Result<bool, TransportError>;
}

// ── BufferedSource ────────────────────────────────────────────────────────────

/// Adapts a [`ReassemblyBuffer`] into a [`FrameSource`] — the relay path:
/// frames assembled from the push client are drained here and re-sent to the
/// play client. Each pull copies the frame out of its slot and returns the
/// slot before yielding, honoring the single-outstanding-frame discipline.
pub struct BufferedSource {
    buffer: Arc<ReassemblyBuffer>,
    poll_timeout: Duration,
}

impl BufferedSource {
    pub fn new(buffer: Arc<ReassemblyBuffer>, poll_timeout: Duration) -> Self {
        Self {
            buffer,
            poll_timeout,
        }
    }
}

#[async_trait]
impl FrameSource for BufferedSource {
    async fn next_frame(&mut self, scratch: &mut Frame) -> Result<bool, TransportError> {
        let Some(frame) = self.buffer.get_frame(self.poll_timeout).await else {
            return Ok(false);
        };
        let data = frame.data();
        if data.len() > scratch.data.len() {
            return Err(TransportError::FrameTooLarge {
                len: data.len(),
                max: scratch.data.len(),
            });
        }
        scratch.meta = *frame.meta();
        scratch.data[..data.len()].copy_from_slice(data);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_core::{FrameMeta, PixelFormat, Timestamp};
    use framelink_proto::fragment::Fragment;

    #[tokio::test]
    async fn buffered_source_drains_and_returns_slots() {
        let buffer = Arc::new(ReassemblyBuffer::new(2, 2000, PixelFormat::Yuyv));
        let meta = FrameMeta {
            len: 1500,
            width: 10,
            height: 10,
            format: PixelFormat::Yuyv,
            timestamp: Timestamp::new(3, 3),
        };
        let data = vec![0x3C; 1500];
        buffer
            .process_fragment(&Fragment::for_chunk(&meta, 2, 0, &data[..1400]))
            .unwrap();
        buffer
            .process_fragment(&Fragment::for_chunk(&meta, 2, 1, &data[1400..]))
            .unwrap();

        let mut source = BufferedSource::new(Arc::clone(&buffer), Duration::from_millis(10));
        let mut scratch = Frame::scratch(2000, PixelFormat::Yuyv);

        assert!(source.next_frame(&mut scratch).await.unwrap());
        assert_eq!(scratch.meta.len, 1500);
        assert_eq!(scratch.payload(), &data[..]);

        // Queue drained; slot was returned on drop, nothing further to pull
        assert!(!source.next_frame(&mut scratch).await.unwrap());
        assert_eq!(buffer.ready_len(), 0);
    }
}
