//! Per-connection data-protocol engine.
//!
//! One instance exists per logical data stream (push-data, play-data) for
//! the lifetime of its owning connection handler. The engine alternates a
//! LOOP pass (move one frame or fragment) with a CONTROL pass (post-action
//! housekeeping, currently a pass-through) until its enable flag clears or
//! an unrecoverable error ends the run.
//!
//! # NAT signaling
//!
//! ```text
//! Receiver (behind NAT)                       Sender
//! ─────────────────────                       ───────────────────────────
//! idle ≥ 5 s → 10× "BULLET" ────────────────► ensure_peer(): block-read one
//!                                             punch, drain stragglers, keep
//! ◄──────────────────────────── fragments ─── the newest source address
//! ```
//!
//! Punch bursts carry an explicit failure bound; a path that cannot even
//! send its punches surfaces [`TransportError::NatPunchFailed`] instead of
//! spinning forever.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use framelink_core::{Frame, FrameConfig, TransportError};
use framelink_proto::fragment::{Fragment, FRAGMENT_WIRE_SIZE};
use framelink_proto::NAT_PUNCH;

use crate::reassembly::ReassemblyBuffer;
use crate::source::FrameSource;

// ── Tuning constants ──────────────────────────────────────────────────────────

/// Idle threshold before NAT signaling kicks in on either side.
pub const NAT_TRAVERSAL_INTERVAL: Duration = Duration::from_secs(5);
/// Punch datagrams per burst.
pub const NAT_PUNCH_BURST: u32 = 10;
/// Consecutive fully-failed bursts tolerated before giving up.
pub const NAT_PUNCH_MAX_FAILURES: u32 = 5;

/// Bounded read used by the receive loop so the enable flag is observed
/// at least this often.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);
/// Pacing between fragment sends — prevents receiver-side overrun.
const INTER_CHUNK_PACING: Duration = Duration::from_micros(200);
/// Settle delay after the last fragment of a frame.
const SEND_SETTLE: Duration = Duration::from_millis(2);
/// Backoff when the frame source has nothing for us.
const SOURCE_IDLE_BACKOFF: Duration = Duration::from_millis(5);

// ── Types ─────────────────────────────────────────────────────────────────────

/// Whether the peer address is fixed or must be learned via hole punching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMode {
    Direct,
    Nat,
}

/// Clonable start/stop handle for a running data protocol.
///
/// `stop` is an advisory atomic store — the run loop observes it between
/// blocking operations, so callers must tolerate a short tail of in-flight
/// activity.
#[derive(Debug, Clone)]
pub struct DataHandle {
    enabled: Arc<AtomicBool>,
}

impl DataHandle {
    pub fn start(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

/// Per-direction data-stream state: mode, last-traffic stamp, enable flag,
/// learned/fixed peer address, and the active frame geometry.
pub struct DataProtocol {
    label: &'static str,
    mode: DataMode,
    enabled: Arc<AtomicBool>,
    frame_config: FrameConfig,
    peer: Option<SocketAddr>,
    last_traffic: Instant,
    punch_failures: u32,
}

impl DataProtocol {
    /// Create a stopped instance; call [`DataHandle::start`] (or
    /// [`start`](Self::start)) before running.
    pub fn new(label: &'static str, mode: DataMode, frame_config: FrameConfig) -> Self {
        Self {
            label,
            mode,
            enabled: Arc::new(AtomicBool::new(false)),
            frame_config,
            peer: None,
            last_traffic: Instant::now(),
            punch_failures: 0,
        }
    }

    pub fn handle(&self) -> DataHandle {
        DataHandle {
            enabled: Arc::clone(&self.enabled),
        }
    }

    pub fn start(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Fix the peer address (punch target for NAT receivers, destination for
    /// direct senders using unconnected sockets).
    pub fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }

    pub fn frame_config(&self) -> &FrameConfig {
        &self.frame_config
    }

    /// Echo a parameter change into the active frame geometry.
    pub fn set_frame_config(&mut self, cfg: FrameConfig) {
        self.frame_config = cfg;
    }

    fn running(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Backdate the traffic stamp so the first loop pass treats the path as
    /// idle and signals immediately.
    fn mark_idle(&mut self) {
        self.last_traffic = Instant::now()
            .checked_sub(NAT_TRAVERSAL_INTERVAL)
            .unwrap_or_else(Instant::now);
    }

    // ── Receive path ──────────────────────────────────────────────────────────

    /// Drive the receive side: optional NAT punching, then bounded reads of
    /// one fragment at a time into `buffer`. Returns when the enable flag
    /// clears (Ok) or on the first unrecoverable socket error.
    pub async fn run_recv(
        &mut self,
        socket: &UdpSocket,
        buffer: &ReassemblyBuffer,
    ) -> Result<(), TransportError> {
        info!("[{}] recv loop up (mode {:?})", self.label, self.mode);
        let mut wire = [0u8; FRAGMENT_WIRE_SIZE];
        self.mark_idle();

        while self.running() {
            // LOOP pass
            if self.mode == DataMode::Nat
                && self.last_traffic.elapsed() >= NAT_TRAVERSAL_INTERVAL
            {
                self.send_punch_burst(socket).await?;
            }

            match tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut wire)).await {
                Ok(Ok((n, from))) => {
                    self.last_traffic = Instant::now();
                    if n == FRAGMENT_WIRE_SIZE {
                        match Fragment::decode(&wire) {
                            Ok(frag) => match buffer.process_fragment(&frag) {
                                Ok(()) => {}
                                Err(TransportError::FrameTooLarge { len, max }) => {
                                    // Configuration error: drop the fragment,
                                    // keep the stream alive.
                                    warn!(
                                        "[{}] frame of {} bytes exceeds slot capacity {} — dropped",
                                        self.label, len, max
                                    );
                                }
                                Err(TransportError::FragmentOutOfRange { index, total }) => {
                                    warn!(
                                        "[{}] fragment index {} outside slot range {} — dropped",
                                        self.label, index, total
                                    );
                                }
                                Err(e) => return Err(e),
                            },
                            Err(e) => {
                                warn!("[{}] undecodable fragment from {}: {}", self.label, from, e);
                            }
                        }
                    } else if n == NAT_PUNCH.len() {
                        trace!("[{}] stray punch from {} — ignored", self.label, from);
                    } else {
                        warn!("[{}] short datagram ({} bytes) from {}", self.label, n, from);
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {} // read timeout — fall through to re-check the flag
            }

            // CONTROL pass: post-action housekeeping, currently a pass-through.
        }

        info!("[{}] recv loop stopped", self.label);
        Ok(())
    }

    /// Fire one punch burst toward the configured peer.
    async fn send_punch_burst(&mut self, socket: &UdpSocket) -> Result<(), TransportError> {
        let Some(peer) = self.peer else {
            return Err(TransportError::NatPunchFailed { attempts: 0 });
        };
        let mut sent = 0u32;
        for _ in 0..NAT_PUNCH_BURST {
            if socket.send_to(NAT_PUNCH, peer).await.is_ok() {
                sent += 1;
            }
        }
        self.last_traffic = Instant::now();
        if sent == 0 {
            self.punch_failures += 1;
            warn!(
                "[{}] punch burst to {} failed entirely ({}/{})",
                self.label, peer, self.punch_failures, NAT_PUNCH_MAX_FAILURES
            );
            if self.punch_failures >= NAT_PUNCH_MAX_FAILURES {
                return Err(TransportError::NatPunchFailed {
                    attempts: self.punch_failures * NAT_PUNCH_BURST,
                });
            }
        } else {
            self.punch_failures = 0;
            debug!("[{}] punched {} → {}", self.label, sent, peer);
        }
        Ok(())
    }

    // ── Send path ─────────────────────────────────────────────────────────────

    /// Drive the send side: pull frames from `source` (single-pass,
    /// non-blocking contract), refresh the NAT mapping when idle, and send
    /// each frame as paced fragments.
    pub async fn run_send<S: FrameSource + ?Sized>(
        &mut self,
        socket: &UdpSocket,
        source: &mut S,
        scratch: &mut Frame,
    ) -> Result<(), TransportError> {
        info!("[{}] send loop up (mode {:?})", self.label, self.mode);
        self.mark_idle();

        while self.running() {
            // LOOP pass
            if !source.next_frame(scratch).await? {
                tokio::time::sleep(SOURCE_IDLE_BACKOFF).await;
                continue;
            }

            if self.mode == DataMode::Nat {
                self.ensure_peer(socket).await?;
                if !self.running() {
                    break;
                }
            }

            for frag in Fragment::packetize(scratch) {
                self.send_fragment(socket, &frag).await?;
                tokio::time::sleep(INTER_CHUNK_PACING).await;
            }
            tokio::time::sleep(SEND_SETTLE).await;
            self.last_traffic = Instant::now();

            // CONTROL pass: post-action housekeeping, currently a pass-through.
        }

        info!("[{}] send loop stopped", self.label);
        Ok(())
    }

    async fn send_fragment(
        &self,
        socket: &UdpSocket,
        frag: &Fragment,
    ) -> Result<(), TransportError> {
        let wire = frag.encode();
        match self.peer {
            Some(peer) => socket.send_to(&wire, peer).await?,
            None => socket.send(&wire).await?,
        };
        Ok(())
    }

    /// Learn (or refresh) the receiver's address from its punch datagrams.
    ///
    /// Clears any previously fixed peer, block-receives one valid punch, then
    /// drains stragglers non-blockingly keeping only the newest source — a
    /// fresher NAT mapping beats an older one.
    async fn ensure_peer(&mut self, socket: &UdpSocket) -> Result<(), TransportError> {
        if self.peer.is_some() && self.last_traffic.elapsed() < NAT_TRAVERSAL_INTERVAL {
            return Ok(());
        }
        self.peer = None;

        let mut buf = [0u8; 64];
        let mut learned: Option<SocketAddr> = None;

        while self.running() && learned.is_none() {
            match tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) => {
                    if &buf[..n] == NAT_PUNCH {
                        learned = Some(from);
                    } else {
                        warn!("[{}] invalid punch payload from {} — ignored", self.label, from);
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {} // keep waiting, re-checking the enable flag
            }
        }

        // Drain any queued punches; the last one reflects the freshest mapping.
        loop {
            match socket.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    if &buf[..n] == NAT_PUNCH {
                        learned = Some(from);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(peer) = learned {
            info!("[{}] learned peer {} via punch", self.label, peer);
            self.peer = Some(peer);
            self.last_traffic = Instant::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FrameSource;
    use async_trait::async_trait;
    use framelink_core::{FrameMeta, PixelFormat, Timestamp};

    async fn sock() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    /// Produces `count` single-chunk frames filled with the frame index.
    struct CountingSource {
        count: usize,
        produced: usize,
    }

    #[async_trait]
    impl FrameSource for CountingSource {
        async fn next_frame(&mut self, scratch: &mut Frame) -> Result<bool, TransportError> {
            if self.produced >= self.count {
                return Ok(false);
            }
            let len = 900;
            scratch.meta = FrameMeta {
                len,
                width: 30,
                height: 30,
                format: PixelFormat::Yuyv,
                timestamp: Timestamp::new(self.produced as i64, 0),
            };
            scratch.data[..len].fill(self.produced as u8);
            self.produced += 1;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn direct_send_reaches_connected_peer() {
        let rx = sock().await;
        let tx = sock().await;
        tx.connect(rx.local_addr().unwrap()).await.unwrap();

        let mut proto = DataProtocol::new("test-send", DataMode::Direct, FrameConfig::default());
        let handle = proto.handle();
        handle.start();

        let send_task = async {
            let mut source = CountingSource {
                count: 2,
                produced: 0,
            };
            let mut scratch = Frame::scratch(2000, PixelFormat::Yuyv);
            proto.run_send(&tx, &mut source, &mut scratch).await
        };

        let recv_task = async {
            let mut wire = [0u8; FRAGMENT_WIRE_SIZE];
            let mut seen = Vec::new();
            while seen.len() < 2 {
                let (n, _) = rx.recv_from(&mut wire).await.unwrap();
                assert_eq!(n, FRAGMENT_WIRE_SIZE);
                let frag = Fragment::decode(&wire).unwrap();
                seen.push(frag.timestamp.sec);
            }
            handle.stop();
            seen
        };

        let (sent, seen) = tokio::join!(send_task, recv_task);
        sent.unwrap();
        assert_eq!(seen, vec![0, 1]);
    }

    #[tokio::test]
    async fn recv_loop_feeds_reassembly_buffer() {
        let rx = sock().await;
        let rx_addr = rx.local_addr().unwrap();
        let tx = sock().await;

        let buffer = ReassemblyBuffer::new(2, 4000, PixelFormat::Yuyv);
        let mut proto = DataProtocol::new("test-recv", DataMode::Direct, FrameConfig::default());
        let handle = proto.handle();
        handle.start();

        let meta = FrameMeta {
            len: 1000,
            width: 20,
            height: 25,
            format: PixelFormat::Yuyv,
            timestamp: Timestamp::new(5, 5),
        };
        let frag = Fragment::for_chunk(&meta, 1, 0, &[0x42; 1000]);
        tx.send_to(&frag.encode(), rx_addr).await.unwrap();

        let recv = proto.run_recv(&rx, &buffer);
        let consume = async {
            let frame = buffer.get_frame(Duration::from_secs(2)).await;
            handle.stop();
            frame.map(|f| f.data().to_vec())
        };
        let (ran, frame) = tokio::join!(recv, consume);
        ran.unwrap();
        assert_eq!(frame.unwrap(), vec![0x42; 1000]);
    }

    #[tokio::test]
    async fn nat_sender_learns_peer_from_punch() {
        let sender = sock().await;
        let sender_addr = sender.local_addr().unwrap();
        let receiver = sock().await;

        let mut proto = DataProtocol::new("test-nat", DataMode::Nat, FrameConfig::default());
        let handle = proto.handle();
        handle.start();

        // Receiver punches first, then expects fragments back at the same
        // ephemeral socket.
        receiver.send_to(NAT_PUNCH, sender_addr).await.unwrap();

        let send_task = async {
            let mut source = CountingSource {
                count: 1,
                produced: 0,
            };
            let mut scratch = Frame::scratch(2000, PixelFormat::Yuyv);
            proto.run_send(&sender, &mut source, &mut scratch).await
        };

        let recv_task = async {
            let mut wire = [0u8; FRAGMENT_WIRE_SIZE];
            let (n, from) = receiver.recv_from(&mut wire).await.unwrap();
            handle.stop();
            (n, from)
        };

        let (sent, (n, from)) = tokio::join!(send_task, recv_task);
        sent.unwrap();
        assert_eq!(n, FRAGMENT_WIRE_SIZE);
        assert_eq!(from, sender_addr);
    }

    #[tokio::test]
    async fn stop_is_observed_by_recv_loop() {
        let rx = sock().await;
        let buffer = ReassemblyBuffer::new(1, 2000, PixelFormat::Yuyv);
        let mut proto = DataProtocol::new("test-stop", DataMode::Direct, FrameConfig::default());
        let handle = proto.handle();
        handle.start();

        let stopper = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.stop();
        };
        let (ran, ()) = tokio::join!(proto.run_recv(&rx, &buffer), stopper);
        ran.unwrap();
    }
}
