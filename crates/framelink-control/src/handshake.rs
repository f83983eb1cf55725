//! Legacy control-plane handshake: HELLO → READY → IDLE.
//!
//! Both roles exchange the literal words in lock-step; the initiator writes
//! first, the responder echoes. Any payload mismatch reverts the state
//! machine to HELLO and the exchange starts over on the same connection; a
//! zero-byte read (peer gone) is a hard error. On success the connection is
//! IDLE — suspended until the caller hands it to the control engine.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use framelink_core::ControlError;
use framelink_proto::{HELLO, READY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Hello,
    Ready,
}

/// Run the handshake to completion (IDLE) or hard failure.
pub async fn handshake<S>(stream: &mut S, role: HandshakeRole) -> Result<(), ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut phase = Phase::Hello;
    loop {
        let (word, expected): (&[u8], &'static str) = match phase {
            Phase::Hello => (HELLO, "HELLO"),
            Phase::Ready => (READY, "READY"),
        };

        let matched = match role {
            HandshakeRole::Initiator => {
                stream.write_all(word).await?;
                stream.flush().await?;
                read_word(stream, word).await?
            }
            HandshakeRole::Responder => {
                let ok = read_word(stream, word).await?;
                if ok {
                    stream.write_all(word).await?;
                    stream.flush().await?;
                }
                ok
            }
        };

        if !matched {
            warn!("Handshake mismatch in {:?} phase — restarting at HELLO", phase);
            phase = Phase::Hello;
            continue;
        }

        match phase {
            Phase::Hello => {
                debug!("Handshake HELLO done ({:?})", role);
                phase = Phase::Ready;
            }
            Phase::Ready => {
                debug!("Handshake READY done ({:?}) — connection idle", role);
                return Ok(());
            }
        }
    }
}

/// Read exactly `expected.len()` bytes and compare. EOF mid-word is fatal.
async fn read_word<S>(stream: &mut S, expected: &[u8]) -> Result<bool, ControlError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8];
    let n = expected.len();
    let res = stream.read_exact(&mut buf[..n]).await;
    match res {
        Ok(_) => Ok(&buf[..n] == expected),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ControlError::ConnectionClosed)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn both_roles_complete() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let (ra, rb) = tokio::join!(
            handshake(&mut a, HandshakeRole::Initiator),
            handshake(&mut b, HandshakeRole::Responder),
        );
        ra.unwrap();
        rb.unwrap();
    }

    #[tokio::test]
    async fn responder_reverts_to_hello_on_mismatch() {
        let (mut ours, mut theirs) = tokio::io::duplex(64);
        let responder = handshake(&mut ours, HandshakeRole::Responder);

        let script = async {
            let mut echo = [0u8; 5];
            // Clean HELLO
            theirs.write_all(b"HELLO").await.unwrap();
            theirs.read_exact(&mut echo).await.unwrap();
            assert_eq!(&echo, b"HELLO");
            // Garbage where READY belongs — responder restarts at HELLO
            theirs.write_all(b"BOGUS").await.unwrap();
            // Full clean exchange
            theirs.write_all(b"HELLO").await.unwrap();
            theirs.read_exact(&mut echo).await.unwrap();
            assert_eq!(&echo, b"HELLO");
            theirs.write_all(b"READY").await.unwrap();
            theirs.read_exact(&mut echo).await.unwrap();
            assert_eq!(&echo, b"READY");
        };

        let (res, ()) = tokio::join!(responder, script);
        res.unwrap();
    }

    #[tokio::test]
    async fn peer_disappearing_is_hard_error() {
        let (mut ours, theirs) = tokio::io::duplex(64);
        drop(theirs);
        let err = handshake(&mut ours, HandshakeRole::Responder)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::ConnectionClosed));
    }
}
