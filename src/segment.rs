use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// One UDP-carried protocol unit. Encoding and decoding are pure; all connection state
///  lives in [crate::connection].
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Assigned from the per-connection counter (starting at 1) for ackable bodies, 0 for ACKs.
    pub sequence: u32,
    /// Send timestamp on the sender's own clock, echoed back in the corresponding ACK.
    pub time: f64,
    /// The sender's self-declared identity - stable across address changes. NUL-free:
    ///  the wire encoding is NUL-terminated, so an interior NUL would not round-trip.
    pub host: String,
    pub body: SegmentBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentBody {
    /// An opaque application payload.
    Data(Bytes),
    /// Cumulative acknowledgment: all sequence numbers `<= ack` were received.
    Ack(u32),
    /// Advertises the sender's receive capacity: the highest sequence it will buffer.
    Window(u32),
    /// Content-free; refreshes the peer's liveness timer during idle periods.
    KeepAlive,
    /// Content-free; one half of the symmetric close handshake.
    Close,
}

impl SegmentBody {
    const TAG_DATA: u8 = 0;
    const TAG_ACK: u8 = 1;
    const TAG_WINDOW: u8 = 2;
    const TAG_KEEP_ALIVE: u8 = 3;
    const TAG_CLOSE: u8 = 4;

    /// Ackable bodies consume a sequence number and are retransmitted until a cumulative
    ///  ACK covers them; ACKs themselves are not.
    pub fn is_ackable(&self) -> bool {
        !matches!(self, SegmentBody::Ack(_))
    }
}

impl Segment {
    pub fn ser(&self, buf: &mut BytesMut) {
        debug_assert!(!self.host.contains('\0'), "host identity must be NUL-free");

        buf.put_u32(self.sequence);
        buf.put_f64(self.time);
        buf.put_slice(self.host.as_bytes());
        buf.put_u8(0);

        match &self.body {
            SegmentBody::Data(message) => {
                buf.put_u8(SegmentBody::TAG_DATA);
                buf.put_slice(message);
            }
            SegmentBody::Ack(ack) => {
                buf.put_u8(SegmentBody::TAG_ACK);
                buf.put_u32(*ack);
            }
            SegmentBody::Window(max_sequence) => {
                buf.put_u8(SegmentBody::TAG_WINDOW);
                buf.put_u32(*max_sequence);
            }
            SegmentBody::KeepAlive => buf.put_u8(SegmentBody::TAG_KEEP_ALIVE),
            SegmentBody::Close => buf.put_u8(SegmentBody::TAG_CLOSE),
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Segment> {
        let sequence = buf.try_get_u32()?;
        let time = buf.try_get_f64()?;

        let mut host_bytes = Vec::new();
        loop {
            match buf.try_get_u8()? {
                0 => break,
                b => host_bytes.push(b),
            }
        }
        let host = String::from_utf8(host_bytes)?;

        let body = match buf.try_get_u8()? {
            SegmentBody::TAG_DATA => SegmentBody::Data(buf.copy_to_bytes(buf.remaining())),
            SegmentBody::TAG_ACK => SegmentBody::Ack(buf.try_get_u32()?),
            SegmentBody::TAG_WINDOW => SegmentBody::Window(buf.try_get_u32()?),
            SegmentBody::TAG_KEEP_ALIVE => SegmentBody::KeepAlive,
            SegmentBody::TAG_CLOSE => SegmentBody::Close,
            tag => bail!("unknown segment body tag {}", tag),
        };

        if buf.has_remaining() {
            bail!("trailing data after segment body");
        }

        Ok(Segment { sequence, time, host, body })
    }
}
