use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::{Buf, BytesMut};
use tracing::*;

use mavlink::{common, MavHeader, MavlinkVersion};
use tokio::net::{ToSocketAddrs, UdpSocket};

const MAGIC_V2: u8 = 0xFD;

/// Framed MAVLink v2 endpoint over UDP. The peer address is learned from
/// the first packet to arrive and locked in.
pub struct AutopilotInterface {
    sock: Arc<UdpSocket>,
    buf: BytesMut,
    sequence: Arc<AtomicU8>,
    last_seq: Option<u8>,
    boot: Instant,
}

/// Transmit half; cheap to clone and usable while `recv` is pending.
#[derive(Clone)]
pub struct AutopilotSender {
    sock: Arc<UdpSocket>,
    sequence: Arc<AtomicU8>,
    boot: Instant,
}

impl AutopilotInterface {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> anyhow::Result<Self> {
        let sock = UdpSocket::bind(addr)
            .await
            .context("failed to bind autopilot endpoint")?;

        debug!("waiting for first packet from the autopilot link");

        let (_, remote) = tokio::time::timeout(Duration::from_secs(60), sock.recv_from(&mut []))
            .await
            .context("timed out waiting for a packet from the autopilot link")?
            .context("error receiving from the autopilot link")?;

        info!("autopilot link is {:?}, locking to this address", remote);
        sock.connect(remote)
            .await
            .context("failed to lock to autopilot address")?;

        Ok(AutopilotInterface {
            sock: Arc::new(sock),
            buf: BytesMut::with_capacity(1024),
            sequence: Arc::new(AtomicU8::default()),
            last_seq: None,
            boot: Instant::now(),
        })
    }

    pub fn sender(&self) -> AutopilotSender {
        AutopilotSender {
            sock: self.sock.clone(),
            sequence: self.sequence.clone(),
            boot: self.boot,
        }
    }

    /// Next well-formed message from the stream. Skips garbage between
    /// frames and resynchronizes on packet loss.
    pub async fn recv(&mut self) -> anyhow::Result<(MavHeader, common::MavMessage)> {
        loop {
            let mut chunk = vec![0; 1024];

            // a frame header needs at least two bytes after the magic
            let start = loop {
                match self.buf.iter().position(|&b| b == MAGIC_V2) {
                    Some(start) if start + 2 < self.buf.len() => break start,
                    _ => {
                        let n = self.sock.recv(&mut chunk[..]).await?;
                        self.buf.extend(&chunk[..n]);
                    }
                }
            };

            let payload_len = self.buf[start + 1] as usize;
            let seq = self.buf[start + 4];

            if let Some(prev) = self.last_seq {
                if prev.wrapping_add(1) != seq {
                    debug!(
                        "sequence jumped from {} to {}, assuming packet loss",
                        prev, seq
                    );
                }
            }
            self.last_seq = Some(seq);

            // magic + len + 8 byte header + payload + 2 byte checksum
            let frame_len = payload_len + 12;
            while start + frame_len > self.buf.len() {
                let n = self.sock.recv(&mut chunk[..]).await?;
                self.buf.extend(&chunk[..n]);
            }

            let frame = &self.buf[start..start + frame_len];
            match mavlink::read_versioned_msg(&mut &frame[..], MavlinkVersion::V2) {
                Ok((header, message)) => {
                    self.buf.advance(start + frame_len);
                    return Ok((header, message));
                }
                Err(err) => {
                    // bad checksum or an unknown id; drop the magic byte
                    // and rescan
                    trace!("undecodable frame ({:?}), resynchronizing", err);
                    self.buf.advance(start + 1);
                }
            }
        }
    }
}

impl AutopilotSender {
    /// Milliseconds since this endpoint came up, for outgoing stamps.
    pub fn boot_ms(&self) -> u32 {
        self.boot.elapsed().as_millis() as u32
    }

    pub async fn send(&self, message: common::MavMessage) -> anyhow::Result<()> {
        let header = MavHeader {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            system_id: 1,
            component_id: 191,
        };

        let mut buf = Vec::with_capacity(280);
        mavlink::write_versioned_msg(&mut buf, MavlinkVersion::V2, header, &message)?;
        self.sock.send(&buf).await?;

        Ok(())
    }
}
