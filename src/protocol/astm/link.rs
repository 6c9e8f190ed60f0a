use std::time::Duration;

use log::{debug, trace, warn};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::protocol::error::{ProtocolError, Result};

use super::constants::{
    ACK, ENQ, ENQ_ACK_TIMEOUT_MS, EOT, FIRST_FRAME_SEQUENCE, FRAME_ACK_TIMEOUT_MS, LF,
    MAX_FRAME_PAYLOAD, MAX_FRAME_RETRIES, NAK, INTRA_TRANSMISSION_TIMEOUT_MS,
};
use super::frame::{split_into_frames_with_limit, Frame};

/// Link-layer state of one analyzer connection. The link is half-duplex;
/// `busy` means any state other than `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Idle,
    WaitingForAck,
    Receiving,
    Transmitting,
    Error,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkState::Idle => "IDLE",
            LinkState::WaitingForAck => "WAITING_FOR_ACK",
            LinkState::Receiving => "RECEIVING",
            LinkState::Transmitting => "TRANSMITTING",
            LinkState::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Protocol timers, defaulted per the link standard and overridable from
/// instrument configuration
#[derive(Debug, Clone)]
pub struct LinkTimeouts {
    /// How long the sender waits for the answer to its ENQ
    pub enq_ack: Duration,
    /// How long the sender waits for the ACK/NAK after each frame
    pub frame_ack: Duration,
    /// Receive-side inactivity limit inside one transmission
    pub intra_transmission: Duration,
    /// Pause before re-enquiring after the peer NAKed our ENQ
    pub enq_retry_delay: Duration,
}

impl Default for LinkTimeouts {
    fn default() -> Self {
        Self {
            enq_ack: Duration::from_millis(ENQ_ACK_TIMEOUT_MS),
            frame_ack: Duration::from_millis(FRAME_ACK_TIMEOUT_MS),
            intra_transmission: Duration::from_millis(INTRA_TRANSMISSION_TIMEOUT_MS),
            enq_retry_delay: Duration::from_secs(10),
        }
    }
}

/// Outcome of a send attempt that did not error
#[derive(Debug)]
pub enum SendOutcome {
    /// The full transmission was acknowledged and EOT sent
    Sent,
    /// The peer enquired first; its transmission was received instead and
    /// the caller must re-queue the outbound content
    YieldedToInbound(Vec<u8>),
}

/// The ASTM E1381 link state machine over one socket.
///
/// Strictly single-owner: every read and write on the stream goes through
/// `&mut self`, so the owning task is the only task that can touch the
/// socket. Callers multiplex inbound bytes, outbound requests and timer
/// ticks in their own loop and call into the machine from there.
pub struct AstmLink<S> {
    stream: S,
    state: LinkState,
    timeouts: LinkTimeouts,
    max_frame_payload: usize,
    peer: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AstmLink<S> {
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            state: LinkState::Idle,
            timeouts: LinkTimeouts::default(),
            max_frame_payload: MAX_FRAME_PAYLOAD,
            peer: peer.into(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: LinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_max_frame_payload(mut self, limit: usize) -> Self {
        self.max_frame_payload = limit.max(1);
        self
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.state != LinkState::Idle
    }

    /// Tear down the stream on shutdown or fatal error
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
        self.state = LinkState::Error;
    }

    /// Read one byte. Cancel-safe, so the owning loop may race it against
    /// its mailbox in `select!`.
    pub async fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        let n = self.stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(byte[0])
    }

    async fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.stream.write_all(&[byte]).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_byte_timeout(&mut self, limit: Duration) -> Result<Option<u8>> {
        match timeout(limit, self.read_byte()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// React to the first byte of a possible inbound transmission, read by
    /// the owner while the link was idle.
    ///
    /// Returns the complete transmission content on ENQ, `None` for any
    /// other byte (discarded silently per the standard).
    pub async fn handle_inbound(&mut self, first_byte: u8) -> Result<Option<Vec<u8>>> {
        if first_byte != ENQ {
            trace!(
                "[{}] Discarding byte 0x{:02X} received while idle",
                self.peer,
                first_byte
            );
            return Ok(None);
        }

        debug!("[{}] Received ENQ, acknowledging", self.peer);
        self.state = LinkState::Receiving;
        self.write_byte(ACK).await?;

        let content = self.receive_frames().await;
        match content {
            Ok(content) => {
                self.state = LinkState::Idle;
                Ok(Some(content))
            }
            Err(e) => {
                self.state = LinkState::Error;
                Err(e)
            }
        }
    }

    /// Accumulate frames until the EOT that follows the ETX frame.
    ///
    /// Invalid frames and unexpected sequence numbers are NAKed without
    /// advancing the expected sequence; six consecutive NAKs abandon the
    /// transmission.
    async fn receive_frames(&mut self) -> Result<Vec<u8>> {
        let mut message = Vec::new();
        let mut expected_sequence = FIRST_FRAME_SEQUENCE;
        let mut consecutive_naks = 0u32;
        let mut final_frame_seen = false;

        loop {
            let first = self
                .read_byte_timeout(self.timeouts.intra_transmission)
                .await?
                .ok_or(ProtocolError::ReceiveTimeout)?;

            if first == EOT {
                if !final_frame_seen {
                    debug!("[{}] EOT before a final frame; empty transmission", self.peer);
                }
                return Ok(message);
            }

            if final_frame_seen {
                // Only EOT is legal after the ETX frame
                warn!(
                    "[{}] Expected EOT after final frame, got 0x{:02X}",
                    self.peer, first
                );
                consecutive_naks += 1;
                if consecutive_naks >= MAX_FRAME_RETRIES {
                    return Err(ProtocolError::RetryExhausted {
                        attempts: consecutive_naks,
                    });
                }
                self.drain_frame_bytes(first).await?;
                self.write_byte(NAK).await?;
                continue;
            }

            let raw = self.read_frame_bytes(first).await?;

            match Frame::parse(&raw) {
                Ok(frame) if frame.sequence == expected_sequence => {
                    trace!(
                        "[{}] Frame {} accepted ({} bytes, last={})",
                        self.peer,
                        frame.sequence,
                        frame.payload.len(),
                        frame.is_last
                    );
                    message.extend_from_slice(&frame.payload);
                    final_frame_seen = frame.is_last;
                    expected_sequence = Frame::next_sequence(expected_sequence);
                    consecutive_naks = 0;
                    self.write_byte(ACK).await?;
                }
                Ok(frame) => {
                    warn!(
                        "[{}] Frame sequence {} does not match expected {}",
                        self.peer, frame.sequence, expected_sequence
                    );
                    consecutive_naks += 1;
                    if consecutive_naks >= MAX_FRAME_RETRIES {
                        return Err(ProtocolError::RetryExhausted {
                            attempts: consecutive_naks,
                        });
                    }
                    self.write_byte(NAK).await?;
                }
                Err(e) => {
                    warn!("[{}] Rejecting frame: {}", self.peer, e);
                    consecutive_naks += 1;
                    if consecutive_naks >= MAX_FRAME_RETRIES {
                        return Err(ProtocolError::RetryExhausted {
                            attempts: consecutive_naks,
                        });
                    }
                    self.write_byte(NAK).await?;
                }
            }
        }
    }

    /// Read the rest of a frame after its first byte, through the LF
    /// trailer. Record payloads never contain LF, so the first LF closes
    /// the frame.
    async fn read_frame_bytes(&mut self, first: u8) -> Result<Vec<u8>> {
        let mut raw = vec![first];
        loop {
            let byte = self
                .read_byte_timeout(self.timeouts.intra_transmission)
                .await?
                .ok_or(ProtocolError::ReceiveTimeout)?;
            raw.push(byte);
            if byte == LF {
                return Ok(raw);
            }
            if raw.len() > self.max_frame_payload + 64 {
                // Runaway input without a trailer; stop accumulating
                return Ok(raw);
            }
        }
    }

    /// Consume a stray frame-shaped burst after the final frame so the NAK
    /// lands between transmissions rather than mid-frame
    async fn drain_frame_bytes(&mut self, first: u8) -> Result<()> {
        if first == super::constants::STX {
            let _ = self.read_frame_bytes(first).await?;
        }
        Ok(())
    }

    /// Transmit one complete message content (records joined by CR).
    ///
    /// Only legal while idle. Handles the ENQ handshake, frame splitting,
    /// per-frame acknowledgment and the closing EOT. When the peer answers
    /// our ENQ with its own ENQ, the receiver has priority: the inbound
    /// transmission is serviced and returned, and the caller re-queues the
    /// outbound content.
    pub async fn send_transmission(&mut self, content: &[u8]) -> Result<SendOutcome> {
        if self.state != LinkState::Idle {
            return Err(ProtocolError::LinkBusy);
        }

        match self.establish_send().await {
            Ok(()) => {}
            Err(ProtocolError::Contention) => {
                debug!(
                    "[{}] Line contention, yielding to the peer's transmission",
                    self.peer
                );
                self.state = LinkState::Receiving;
                self.write_byte(ACK).await?;
                let inbound = self.receive_frames().await;
                return match inbound {
                    Ok(content) => {
                        self.state = LinkState::Idle;
                        Ok(SendOutcome::YieldedToInbound(content))
                    }
                    Err(e) => {
                        self.state = LinkState::Error;
                        Err(e)
                    }
                };
            }
            Err(e) => {
                self.state = LinkState::Error;
                return Err(e);
            }
        }

        self.state = LinkState::Transmitting;
        let frames = split_into_frames_with_limit(content, self.max_frame_payload);

        for frame in &frames {
            if let Err(e) = self.send_frame(frame).await {
                self.state = LinkState::Error;
                return Err(e);
            }
        }

        self.write_byte(EOT).await?;
        self.state = LinkState::Idle;
        debug!(
            "[{}] Transmission of {} frame(s) complete",
            self.peer,
            frames.len()
        );
        Ok(SendOutcome::Sent)
    }

    /// Run the ENQ handshake. `Err(Contention)` means the peer enquired
    /// first and the caller must yield.
    async fn establish_send(&mut self) -> Result<()> {
        self.state = LinkState::WaitingForAck;

        for attempt in 1..=MAX_FRAME_RETRIES {
            self.write_byte(ENQ).await?;
            trace!("[{}] Sent ENQ (attempt {})", self.peer, attempt);

            match self.read_byte_timeout(self.timeouts.enq_ack).await? {
                Some(ACK) => return Ok(()),
                Some(ENQ) => return Err(ProtocolError::Contention),
                Some(NAK) => {
                    debug!(
                        "[{}] ENQ NAKed by peer (attempt {}), backing off",
                        self.peer, attempt
                    );
                    if attempt == MAX_FRAME_RETRIES {
                        break;
                    }
                    tokio::time::sleep(self.timeouts.enq_retry_delay).await;
                }
                Some(other) => {
                    warn!(
                        "[{}] Unexpected byte 0x{:02X} answering ENQ",
                        self.peer, other
                    );
                    if attempt == MAX_FRAME_RETRIES {
                        break;
                    }
                    tokio::time::sleep(self.timeouts.enq_retry_delay).await;
                }
                None => return Err(ProtocolError::AckTimeout),
            }
        }

        Err(ProtocolError::RetryExhausted {
            attempts: MAX_FRAME_RETRIES,
        })
    }

    /// Send a single frame until it is ACKed. A NAK retransmits, up to the
    /// retry budget; an ACK timeout counts as one NAK and a second
    /// consecutive timeout fails the send.
    async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode();
        let mut consecutive_timeouts = 0u32;

        for attempt in 1..=MAX_FRAME_RETRIES {
            self.stream.write_all(&encoded).await?;
            self.stream.flush().await?;
            trace!(
                "[{}] Sent frame {} ({} bytes, attempt {})",
                self.peer,
                frame.sequence,
                encoded.len(),
                attempt
            );

            match self.read_byte_timeout(self.timeouts.frame_ack).await? {
                Some(ACK) => return Ok(()),
                Some(byte) => {
                    if byte != NAK {
                        warn!(
                            "[{}] Unexpected byte 0x{:02X} answering frame {}, treating as NAK",
                            self.peer, byte, frame.sequence
                        );
                    }
                    consecutive_timeouts = 0;
                    debug!(
                        "[{}] Frame {} NAKed (attempt {}), retransmitting",
                        self.peer, frame.sequence, attempt
                    );
                }
                None => {
                    consecutive_timeouts += 1;
                    if consecutive_timeouts >= 2 {
                        return Err(ProtocolError::AckTimeout);
                    }
                    debug!(
                        "[{}] No answer for frame {} (attempt {}), treating as NAK",
                        self.peer, frame.sequence, attempt
                    );
                }
            }
        }

        Err(ProtocolError::RetryExhausted {
            attempts: MAX_FRAME_RETRIES,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::astm::constants::{ETB, ETX, STX};
    use tokio::io::duplex;

    fn short_timeouts() -> LinkTimeouts {
        LinkTimeouts {
            enq_ack: Duration::from_millis(200),
            frame_ack: Duration::from_millis(200),
            intra_transmission: Duration::from_millis(500),
            enq_retry_delay: Duration::from_millis(5),
        }
    }

    async fn read_exact_byte<S: AsyncRead + Unpin>(stream: &mut S) -> u8 {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.unwrap();
        byte[0]
    }

    #[tokio::test]
    async fn test_receive_single_frame_transmission() {
        let (local, mut remote) = duplex(4096);
        let mut link = AstmLink::new(local, "test").with_timeouts(short_timeouts());

        let content = b"H|\\^&\rR|1|ABO|A\rL|1|N\r".to_vec();
        let frame = Frame::new(1, content.clone(), true);

        let peer = tokio::spawn(async move {
            remote.write_all(&[ENQ]).await.unwrap();
            assert_eq!(read_exact_byte(&mut remote).await, ACK);
            remote.write_all(&frame.encode()).await.unwrap();
            assert_eq!(read_exact_byte(&mut remote).await, ACK);
            remote.write_all(&[EOT]).await.unwrap();
        });

        let first = link.read_byte().await.unwrap();
        let received = link.handle_inbound(first).await.unwrap().unwrap();
        assert_eq!(received, content);
        assert_eq!(link.state(), LinkState::Idle);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_multi_frame_transmission() {
        let (local, mut remote) = duplex(4096);
        let mut link = AstmLink::new(local, "test").with_timeouts(short_timeouts());

        let part1 = b"R|1|ABO|A\r".to_vec();
        let part2 = b"L|1|N\r".to_vec();
        let frame1 = Frame::new(1, part1.clone(), false);
        let frame2 = Frame::new(2, part2.clone(), true);

        let peer = tokio::spawn(async move {
            remote.write_all(&[ENQ]).await.unwrap();
            assert_eq!(read_exact_byte(&mut remote).await, ACK);
            remote.write_all(&frame1.encode()).await.unwrap();
            assert_eq!(read_exact_byte(&mut remote).await, ACK);
            remote.write_all(&frame2.encode()).await.unwrap();
            assert_eq!(read_exact_byte(&mut remote).await, ACK);
            remote.write_all(&[EOT]).await.unwrap();
        });

        let first = link.read_byte().await.unwrap();
        let received = link.handle_inbound(first).await.unwrap().unwrap();

        let mut expected = part1;
        expected.extend_from_slice(&part2);
        assert_eq!(received, expected);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupted_frame_naked_then_retransmission_accepted() {
        let (local, mut remote) = duplex(4096);
        let mut link = AstmLink::new(local, "test").with_timeouts(short_timeouts());

        let content = b"R|1|ABO|A\rL|1|N\r".to_vec();
        let frame = Frame::new(1, content.clone(), true);

        let peer = tokio::spawn(async move {
            remote.write_all(&[ENQ]).await.unwrap();
            assert_eq!(read_exact_byte(&mut remote).await, ACK);

            // Flip one payload byte so the checksum no longer matches
            let mut corrupted = frame.encode();
            corrupted[4] ^= 0x01;
            remote.write_all(&corrupted).await.unwrap();
            assert_eq!(read_exact_byte(&mut remote).await, NAK);

            remote.write_all(&frame.encode()).await.unwrap();
            assert_eq!(read_exact_byte(&mut remote).await, ACK);
            remote.write_all(&[EOT]).await.unwrap();
        });

        let first = link.read_byte().await.unwrap();
        let received = link.handle_inbound(first).await.unwrap().unwrap();
        assert_eq!(received, content);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_sequence_naked_without_advancing() {
        let (local, mut remote) = duplex(4096);
        let mut link = AstmLink::new(local, "test").with_timeouts(short_timeouts());

        let good = Frame::new(1, b"R|1|GLU|5\r".to_vec(), true);
        let bad = Frame::new(5, b"R|1|GLU|5\r".to_vec(), true);

        let peer = tokio::spawn(async move {
            remote.write_all(&[ENQ]).await.unwrap();
            assert_eq!(read_exact_byte(&mut remote).await, ACK);
            remote.write_all(&bad.encode()).await.unwrap();
            assert_eq!(read_exact_byte(&mut remote).await, NAK);
            remote.write_all(&good.encode()).await.unwrap();
            assert_eq!(read_exact_byte(&mut remote).await, ACK);
            remote.write_all(&[EOT]).await.unwrap();
        });

        let first = link.read_byte().await.unwrap();
        let received = link.handle_inbound(first).await.unwrap().unwrap();
        assert_eq!(received, b"R|1|GLU|5\r".to_vec());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_six_consecutive_naks_abandon_reception() {
        let (local, mut remote) = duplex(4096);
        let mut link = AstmLink::new(local, "test").with_timeouts(short_timeouts());

        let bad = Frame::new(3, b"X\r".to_vec(), true);

        let peer = tokio::spawn(async move {
            remote.write_all(&[ENQ]).await.unwrap();
            assert_eq!(read_exact_byte(&mut remote).await, ACK);
            for _ in 0..5 {
                remote.write_all(&bad.encode()).await.unwrap();
                assert_eq!(read_exact_byte(&mut remote).await, NAK);
            }
            // Sixth rejection exhausts the budget; no NAK comes back
            remote.write_all(&bad.encode()).await.unwrap();
        });

        let first = link.read_byte().await.unwrap();
        let result = link.handle_inbound(first).await;
        assert!(matches!(
            result,
            Err(ProtocolError::RetryExhausted { .. })
        ));
        assert_eq!(link.state(), LinkState::Error);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_transmission_happy_path() {
        let (local, mut remote) = duplex(4096);
        let mut link = AstmLink::new(local, "test").with_timeouts(short_timeouts());

        let content = b"H|\\^&\rO|1|S1||ABO|N\rL|1|N\r".to_vec();
        let expected = content.clone();

        let peer = tokio::spawn(async move {
            assert_eq!(read_exact_byte(&mut remote).await, ENQ);
            remote.write_all(&[ACK]).await.unwrap();

            let mut raw = Vec::new();
            loop {
                let byte = read_exact_byte(&mut remote).await;
                raw.push(byte);
                if byte == LF {
                    break;
                }
            }
            let frame = Frame::parse(&raw).unwrap();
            assert_eq!(frame.sequence, 1);
            assert!(frame.is_last);
            assert_eq!(frame.payload, expected);
            remote.write_all(&[ACK]).await.unwrap();

            assert_eq!(read_exact_byte(&mut remote).await, EOT);
        });

        let outcome = link.send_transmission(&content).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Sent));
        assert_eq!(link.state(), LinkState::Idle);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_multi_frame_with_nak_retransmission() {
        let (local, mut remote) = duplex(8192);
        let mut link = AstmLink::new(local, "test")
            .with_timeouts(short_timeouts())
            .with_max_frame_payload(16);

        let content = b"R|1|AAAA|1\rR|2|BBBB|2\rR|3|CCCC|3\r".to_vec();

        let peer = tokio::spawn(async move {
            assert_eq!(read_exact_byte(&mut remote).await, ENQ);
            remote.write_all(&[ACK]).await.unwrap();

            let mut frames = Vec::new();
            let mut naked_once = false;
            loop {
                let mut raw = Vec::new();
                loop {
                    let byte = read_exact_byte(&mut remote).await;
                    if raw.is_empty() && byte == EOT {
                        return frames;
                    }
                    raw.push(byte);
                    if byte == LF {
                        break;
                    }
                }
                let frame = Frame::parse(&raw).unwrap();
                if frame.sequence == 2 && !naked_once {
                    naked_once = true;
                    remote.write_all(&[NAK]).await.unwrap();
                    continue;
                }
                frames.push(frame);
                remote.write_all(&[ACK]).await.unwrap();
            }
        });

        let outcome = link.send_transmission(&content).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Sent));

        let frames = peer.await.unwrap();
        let reassembled: Vec<u8> = frames.iter().flat_map(|f| f.payload.clone()).collect();
        assert_eq!(reassembled, content);
        assert!(frames.last().unwrap().is_last);
    }

    #[tokio::test]
    async fn test_contention_yields_to_inbound() {
        let (local, mut remote) = duplex(4096);
        let mut link = AstmLink::new(local, "test").with_timeouts(short_timeouts());

        let inbound_content = b"R|1|ABO|B\rL|1|N\r".to_vec();
        let inbound_frame = Frame::new(1, inbound_content.clone(), true);

        let peer = tokio::spawn(async move {
            assert_eq!(read_exact_byte(&mut remote).await, ENQ);
            // Contend instead of acknowledging
            remote.write_all(&[ENQ]).await.unwrap();
            assert_eq!(read_exact_byte(&mut remote).await, ACK);
            remote.write_all(&inbound_frame.encode()).await.unwrap();
            assert_eq!(read_exact_byte(&mut remote).await, ACK);
            remote.write_all(&[EOT]).await.unwrap();
        });

        let outcome = link.send_transmission(b"O|1|S9||ABO|N\r").await.unwrap();
        match outcome {
            SendOutcome::YieldedToInbound(received) => {
                assert_eq!(received, inbound_content)
            }
            other => panic!("expected yield, got {:?}", other),
        }
        assert_eq!(link.state(), LinkState::Idle);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_enq_nak_retry_budget() {
        let (local, mut remote) = duplex(4096);
        let mut link = AstmLink::new(local, "test").with_timeouts(short_timeouts());

        let peer = tokio::spawn(async move {
            for _ in 0..MAX_FRAME_RETRIES {
                assert_eq!(read_exact_byte(&mut remote).await, ENQ);
                remote.write_all(&[NAK]).await.unwrap();
            }
        });

        let result = link.send_transmission(b"L|1|N\r").await;
        assert!(matches!(
            result,
            Err(ProtocolError::RetryExhausted { .. })
        ));
        assert_eq!(link.state(), LinkState::Error);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_enq_timeout_fails_send() {
        let (local, _remote) = duplex(4096);
        let mut link = AstmLink::new(local, "test").with_timeouts(short_timeouts());

        let result = link.send_transmission(b"L|1|N\r").await;
        assert!(matches!(result, Err(ProtocolError::AckTimeout)));
    }

    #[tokio::test]
    async fn test_frame_ack_single_timeout_retransmits_second_fails() {
        let (local, mut remote) = duplex(4096);
        let mut link = AstmLink::new(local, "test").with_timeouts(short_timeouts());

        let peer = tokio::spawn(async move {
            assert_eq!(read_exact_byte(&mut remote).await, ENQ);
            remote.write_all(&[ACK]).await.unwrap();
            // Swallow both copies of the frame without answering, then hold
            // the stream open long enough for the sender to time out
            let mut lf_count = 0;
            while lf_count < 2 {
                if read_exact_byte(&mut remote).await == LF {
                    lf_count += 1;
                }
            }
            tokio::time::sleep(Duration::from_millis(800)).await;
        });

        let result = link.send_transmission(b"R|1|ABO|A\r").await;
        assert!(matches!(result, Err(ProtocolError::AckTimeout)));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_rejected_when_busy() {
        let (local, _remote) = duplex(64);
        let mut link = AstmLink::new(local, "test");
        link.state = LinkState::Receiving;

        let result = link.send_transmission(b"x").await;
        assert!(matches!(result, Err(ProtocolError::LinkBusy)));
    }

    #[tokio::test]
    async fn test_sequence_wrap_on_long_send() {
        let (local, mut remote) = duplex(65536);
        let mut link = AstmLink::new(local, "test")
            .with_timeouts(short_timeouts())
            .with_max_frame_payload(8);

        // 9 full frames of 8 bytes: sequences must run 1..7,0,1
        let content = vec![b'Z'; 72];

        let peer = tokio::spawn(async move {
            assert_eq!(read_exact_byte(&mut remote).await, ENQ);
            remote.write_all(&[ACK]).await.unwrap();

            let mut sequences = Vec::new();
            loop {
                let mut raw = Vec::new();
                loop {
                    let byte = read_exact_byte(&mut remote).await;
                    if raw.is_empty() && byte == EOT {
                        return sequences;
                    }
                    raw.push(byte);
                    if byte == LF {
                        break;
                    }
                }
                sequences.push(Frame::parse(&raw).unwrap().sequence);
                remote.write_all(&[ACK]).await.unwrap();
            }
        });

        link.send_transmission(&content).await.unwrap();
        assert_eq!(peer.await.unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 0, 1]);
    }

    #[tokio::test]
    async fn test_intermediate_frames_use_etb_final_uses_etx() {
        let content = vec![b'Q'; 500];
        let frames = split_into_frames_with_limit(&content, 240);
        let encoded: Vec<Vec<u8>> = frames.iter().map(|f| f.encode()).collect();

        for bytes in &encoded[..encoded.len() - 1] {
            assert_eq!(bytes[bytes.len() - 5], ETB);
        }
        let last = encoded.last().unwrap();
        assert_eq!(last[last.len() - 5], ETX);

        // Checksums recomputed per frame
        for bytes in &encoded {
            assert!(Frame::parse(bytes).is_ok());
        }
        assert_eq!(encoded[0][0], STX);
    }
}
