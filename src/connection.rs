use crate::config::NetTaskConfig;
use crate::rtt::RttEstimator;
use crate::segment::{Segment, SegmentBody};
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// What a connection wants done when its timers are serviced.
#[derive(Debug, PartialEq)]
pub enum TimeoutAction {
    /// Nothing is due.
    Idle,
    /// Transmit this segment (a retransmission or a keep-alive).
    Transmit(Segment),
    /// The peer has been silent for longer than the keep-alive timeout. Fatal for this
    ///  connection: a server drops the one peer, a client tears down the whole endpoint.
    PeerDead,
}

/// The local send queue is at capacity. Recoverable: the caller waits for ACKs to drain
///  the queue and retries.
#[derive(Debug, PartialEq)]
pub struct SendQueueFull;

/// Per-peer protocol state machine. All operations are free of I/O: they mutate state and
///  return segments for the endpoint to put on the wire. Time is passed in explicitly
///  (seconds on the endpoint's monotonic clock), which keeps every timer decision testable
///  against a simulated clock.
pub struct Connection {
    config: Arc<NetTaskConfig>,
    own_host: String,
    /// Only the side that initiated the connection sends keep-alives; the accepting side
    ///  relies on the initiator to keep the link warm.
    initiator: bool,

    // send side
    next_sequence_to_send: u32,
    /// The retransmission queue: everything sent but not yet covered by a cumulative ACK,
    ///  with `time` refreshed on every retransmission.
    unacknowledged: BTreeMap<u32, Segment>,
    /// Highest sequence number the peer has acknowledged.
    other_max_ack: u32,
    /// Highest sequence number the peer's WINDOW advertisements admit.
    other_max_sequence: u32,
    /// Messages accepted from the application but not yet admitted into the send window.
    send_queue: VecDeque<Bytes>,
    /// When something liveness-refreshing was last sent (keep-alive bookkeeping).
    last_sent_time: f64,

    // receive side
    next_sequence_to_receive: u32,
    /// Out-of-order segments waiting for the gap before them to fill.
    reorder_buffer: BTreeMap<u32, Segment>,
    /// Highest sequence received without a gap - the value that gets ACKed.
    own_max_ack: u32,
    /// Highest sequence this side admits; the edge advances as the application consumes
    ///  messages and gets re-advertised in WINDOW segments.
    own_max_sequence: u32,
    segments_consumed_since_window_update: u32,

    rtt: RttEstimator,
    last_received_time: f64,

    // close state
    peer_closed: bool,
    own_close_sequence: Option<u32>,
}

impl Connection {
    pub fn new(own_host: String, initiator: bool, config: Arc<NetTaskConfig>, now: f64) -> Connection {
        Connection {
            own_host,
            initiator,
            next_sequence_to_send: 1,
            unacknowledged: BTreeMap::default(),
            other_max_ack: 0,
            other_max_sequence: 0,
            send_queue: VecDeque::default(),
            last_sent_time: now,
            next_sequence_to_receive: 1,
            reorder_buffer: BTreeMap::default(),
            own_max_ack: 0,
            own_max_sequence: config.receive_window_size,
            segments_consumed_since_window_update: 0,
            rtt: RttEstimator::new(config.initial_timeout, config.min_timeout),
            last_received_time: now,
            peer_closed: false,
            own_close_sequence: None,
            config,
        }
    }

    /// Assigns the next sequence number to an ackable body, registers the segment for
    ///  retransmission and returns it for sending.
    fn next_segment(&mut self, body: SegmentBody, now: f64) -> Segment {
        debug_assert!(body.is_ackable());

        let segment = Segment {
            sequence: self.next_sequence_to_send,
            time: now,
            host: self.own_host.clone(),
            body,
        };
        self.next_sequence_to_send += 1;
        self.unacknowledged.insert(segment.sequence, segment.clone());
        self.last_sent_time = now;
        segment
    }

    /// Admits queued messages into the send window for as long as the peer's advertised
    ///  window has room.
    fn drain_send_queue(&mut self, now: f64) -> Vec<Segment> {
        let mut out = Vec::new();
        while !self.send_queue.is_empty() && self.next_sequence_to_send <= self.other_max_sequence {
            let payload = self.send_queue.pop_front()
                .expect("send queue is non-empty");
            out.push(self.next_segment(SegmentBody::Data(payload), now));
        }
        out
    }

    /// Routes one inbound segment, returning the segments to send in response. Every
    ///  inbound segment of any type counts as a sign of life from the peer.
    pub fn handle_received(&mut self, segment: Segment, now: f64) -> Vec<Segment> {
        self.last_received_time = now;

        match segment.body {
            SegmentBody::Ack(ack) => self.handle_ack(ack, segment.time, now),
            _ => self.handle_ackable(segment, now),
        }
    }

    fn handle_ack(&mut self, ack: u32, echoed_time: f64, now: f64) -> Vec<Segment> {
        // everything <= ack is delivered and never needs retransmission again
        self.unacknowledged = match ack.checked_add(1) {
            Some(next) => self.unacknowledged.split_off(&next),
            None => BTreeMap::default(),
        };

        self.rtt.add_sample(now - echoed_time);

        let mut out = Vec::new();

        // A duplicate ACK means the peer is stuck missing the segment right after it.
        //  Retransmitting that segment immediately recovers much faster than waiting for
        //  the retransmission timer.
        let duplicate = ack < self.next_sequence_to_send - 1 && ack <= self.other_max_ack;
        let mut fast_retransmitted = false;
        if duplicate {
            if let Some(missing) = self.unacknowledged.get_mut(&(ack + 1)) {
                trace!("fast retransmit of segment {} after duplicate ack {}", ack + 1, ack);
                missing.time = now;
                out.push(missing.clone());
                self.last_sent_time = now;
                fast_retransmitted = true;
            }
        }
        if !fast_retransmitted && ack > self.other_max_ack {
            self.other_max_ack = ack;
        }

        // the ACK may have opened up send window room
        out.extend(self.drain_send_queue(now));
        out
    }

    fn handle_ackable(&mut self, segment: Segment, now: f64) -> Vec<Segment> {
        let mut out = Vec::new();
        let echoed_time = segment.time;
        let sequence = segment.sequence;

        if sequence >= self.next_sequence_to_receive {
            if sequence <= self.own_max_sequence {
                self.reorder_buffer.entry(sequence).or_insert(segment.clone());
            }
            else {
                // receiver-side admission control: the peer overran our advertised window
                debug!("dropping segment {} from {:?} beyond the advertised window {}",
                    sequence, segment.host, self.own_max_sequence);
            }
        }

        while self.reorder_buffer.contains_key(&(self.own_max_ack + 1)) {
            self.own_max_ack += 1;
        }

        match segment.body {
            SegmentBody::Window(max_sequence) => {
                if max_sequence > self.other_max_sequence {
                    self.other_max_sequence = max_sequence;
                }
                if self.next_sequence_to_send == 1 {
                    // nothing sent yet: this is the peer opening the connection, and our
                    //  own advertisement completes the handshake
                    debug!("handshake from {:?}, replying with own window advertisement", segment.host);
                    let advertisement = SegmentBody::Window(self.own_max_sequence);
                    out.push(self.next_segment(advertisement, now));
                }
                out.extend(self.drain_send_queue(now));
            }
            SegmentBody::Close => {
                self.peer_closed = true;
                if self.own_close_sequence.is_none() {
                    // close propagates by answering in kind
                    let close = self.next_segment(SegmentBody::Close, now);
                    self.own_close_sequence = Some(close.sequence);
                    out.push(close);
                }
            }
            SegmentBody::Data(_) | SegmentBody::KeepAlive => {}
            SegmentBody::Ack(_) => unreachable!("acks are handled in handle_ack"),
        }

        // Every ackable segment is answered with the current cumulative ACK, echoing the
        //  inbound timestamp so the peer can take an RTT sample. The ACK also resets the
        //  peer's liveness timer, so it counts as a liveness-refreshing send.
        self.last_sent_time = now;
        out.push(Segment {
            sequence: 0,
            time: echoed_time,
            host: self.own_host.clone(),
            body: SegmentBody::Ack(self.own_max_ack),
        });
        out
    }

    /// Services this connection's timers. Priority order: peer death, retransmission of
    ///  the oldest unacknowledged segment, keep-alive emission.
    pub fn act_on_timeout(&mut self, now: f64) -> TimeoutAction {
        if now - self.last_received_time > self.config.keep_alive_timeout.as_secs_f64() {
            return TimeoutAction::PeerDead;
        }

        let retransmission_timeout = self.rtt.retransmission_timeout();
        if let Some((&sequence, oldest)) = self.unacknowledged.iter_mut().next() {
            if now - oldest.time >= retransmission_timeout {
                trace!("retransmission timer fired for segment {}", sequence);
                oldest.time = now;
                let copy = oldest.clone();
                self.rtt.apply_backoff();
                self.last_sent_time = now;
                return TimeoutAction::Transmit(copy);
            }
            return TimeoutAction::Idle;
        }

        if self.initiator
            && self.own_close_sequence.is_none()
            && now - self.last_sent_time >= self.config.keep_alive_interval.as_secs_f64()
        {
            return TimeoutAction::Transmit(self.next_segment(SegmentBody::KeepAlive, now));
        }

        TimeoutAction::Idle
    }

    /// Time until the earliest of the retransmission deadline, the next keep-alive and the
    ///  peer-death deadline. Clamped to the minimum timeout so the driver never busy-waits.
    pub fn time_until_next_timeout(&self, now: f64) -> Duration {
        let mut deadline = self.last_received_time + self.config.keep_alive_timeout.as_secs_f64();

        if let Some((_, oldest)) = self.unacknowledged.iter().next() {
            deadline = deadline.min(oldest.time + self.rtt.retransmission_timeout());
        }
        else if self.initiator && self.own_close_sequence.is_none() {
            deadline = deadline.min(self.last_sent_time + self.config.keep_alive_interval.as_secs_f64());
        }

        Duration::from_secs_f64((deadline - now).max(self.config.min_timeout.as_secs_f64()))
    }

    /// Drains the reorder buffer as far as it is contiguous, extracting application
    ///  payloads and widening the receive window per consumed segment. Returns a fresh
    ///  WINDOW advertisement once enough window credit accumulated since the last one.
    pub fn get_received_messages(&mut self, now: f64) -> (Vec<Bytes>, Option<Segment>) {
        let mut messages = Vec::new();
        while let Some(segment) = self.reorder_buffer.remove(&self.next_sequence_to_receive) {
            self.next_sequence_to_receive += 1;
            self.own_max_sequence += 1;
            self.segments_consumed_since_window_update += 1;

            // CLOSE and KEEP_ALIVE consume sequence numbers but carry nothing to deliver
            if let SegmentBody::Data(payload) = segment.body {
                messages.push(payload);
            }
        }

        let window_update = if self.segments_consumed_since_window_update >= self.config.window_update_threshold
            && self.own_close_sequence.is_none()
        {
            self.segments_consumed_since_window_update = 0;
            let advertisement = SegmentBody::Window(self.own_max_sequence);
            Some(self.next_segment(advertisement, now))
        }
        else {
            None
        };

        (messages, window_update)
    }

    /// Accepts a message for sending, returning whatever the peer's window currently
    ///  admits (possibly nothing).
    pub fn encapsulate_for_sending(&mut self, message: Bytes, now: f64) -> Result<Vec<Segment>, SendQueueFull> {
        if self.send_queue.len() >= self.config.max_send_queue_len {
            return Err(SendQueueFull);
        }
        self.send_queue.push_back(message);
        Ok(self.drain_send_queue(now))
    }

    pub fn has_send_queue_room(&self) -> bool {
        self.send_queue.len() < self.config.max_send_queue_len
    }

    /// The initial window advertisement that starts the handshake (initiator side).
    pub fn prepare_connect_segment(&mut self, now: f64) -> Segment {
        let advertisement = SegmentBody::Window(self.own_max_sequence);
        self.next_segment(advertisement, now)
    }

    /// Established: something was sent, something was acknowledged, and nobody started
    ///  closing yet.
    pub fn is_connected(&self) -> bool {
        self.next_sequence_to_send > 1
            && self.other_max_ack >= 1
            && !self.peer_closed
            && self.own_close_sequence.is_none()
    }

    /// The close handshake started in either direction; no new data belongs on this
    ///  connection anymore.
    pub fn is_closing(&self) -> bool {
        self.peer_closed || self.own_close_sequence.is_some()
    }

    /// Fully closed: the peer's CLOSE was received and the own CLOSE was acknowledged.
    pub fn is_closed(&self) -> bool {
        self.peer_closed
            && match self.own_close_sequence {
                Some(sequence) => !self.unacknowledged.contains_key(&sequence),
                None => false,
            }
    }

    /// Starts the close handshake once nothing is left to deliver. Returns `None` while
    ///  outstanding data still drains (retry after the next ACK) and after a CLOSE was
    ///  already sent (idempotence).
    pub fn close(&mut self, now: f64) -> Option<Segment> {
        if self.own_close_sequence.is_some()
            || !self.unacknowledged.is_empty()
            || !self.send_queue.is_empty()
        {
            return None;
        }

        let close = self.next_segment(SegmentBody::Close, now);
        self.own_close_sequence = Some(close.sequence);
        Some(close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn test_config() -> Arc<NetTaskConfig> {
        let mut config = NetTaskConfig::default_config();
        config.receive_window_size = 8;
        config.window_update_threshold = 4;
        config.max_send_queue_len = 4;
        Arc::new(config)
    }

    fn connection(initiator: bool) -> Connection {
        Connection::new("a".to_string(), initiator, test_config(), 0.0)
    }

    /// an established pair: "a" initiated towards "b", handshake and first ACKs exchanged
    fn established_pair() -> (Connection, Connection) {
        let mut a = connection(true);
        let mut b = Connection::new("b".to_string(), false, test_config(), 0.0);

        let connect = a.prepare_connect_segment(0.0);
        let b_replies = b.handle_received(connect, 0.0);
        assert_eq!(b_replies.len(), 2); // own window advertisement + ack

        for segment in b_replies {
            for reply in a.handle_received(segment, 0.0) {
                b.handle_received(reply, 0.0);
            }
        }

        assert!(a.is_connected());
        assert!(b.is_connected());

        // consume the handshake advertisements so the reorder buffers start out empty
        a.get_received_messages(0.0);
        b.get_received_messages(0.0);

        // the zero-duration handshake RTT samples would make every later timer assertion
        //  depend on EWMA arithmetic; start the timer tests from a clean estimator
        a.rtt = RttEstimator::new(a.config.initial_timeout, a.config.min_timeout);
        b.rtt = RttEstimator::new(b.config.initial_timeout, b.config.min_timeout);
        (a, b)
    }

    fn data_segment(host: &str, sequence: u32, payload: &'static [u8]) -> Segment {
        Segment {
            sequence,
            time: 0.0,
            host: host.to_string(),
            body: SegmentBody::Data(Bytes::from_static(payload)),
        }
    }

    #[test]
    fn test_handshake() {
        let mut a = connection(true);
        let mut b = Connection::new("b".to_string(), false, test_config(), 0.0);

        let connect = a.prepare_connect_segment(0.0);
        assert_eq!(connect.sequence, 1);
        assert_eq!(connect.body, SegmentBody::Window(8));
        assert!(!a.is_connected());

        let b_replies = b.handle_received(connect, 0.0);
        assert_eq!(b_replies[0].sequence, 1);
        assert_eq!(b_replies[0].body, SegmentBody::Window(8));
        assert_eq!(b_replies[1].sequence, 0);
        assert_eq!(b_replies[1].body, SegmentBody::Ack(1));

        let a_replies = b_replies.into_iter()
            .flat_map(|s| a.handle_received(s, 0.0))
            .collect::<Vec<_>>();
        assert!(a.is_connected());

        // a answers b's advertisement with an ack, which establishes b as well
        assert_eq!(a_replies.iter().filter(|s| s.body == SegmentBody::Ack(1)).count(), 1);
        for segment in a_replies {
            b.handle_received(segment, 0.0);
        }
        assert!(b.is_connected());
    }

    #[test]
    fn test_second_window_does_not_restart_handshake() {
        let (mut a, _) = established_pair();

        let replies = a.handle_received(Segment {
            sequence: 2,
            time: 0.0,
            host: "b".to_string(),
            body: SegmentBody::Window(100),
        }, 0.0);

        // just the ack - no second advertisement, since a already sent segments
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].body, SegmentBody::Ack(2));
        assert_eq!(a.other_max_sequence, 100);
    }

    #[test]
    fn test_in_order_delivery_despite_reordering_and_duplication() {
        let (_, mut b) = established_pair();
        let first_data = b.next_sequence_to_receive;

        // segments arrive as 3, 2, 3 (dup), 1
        let m1 = data_segment("a", first_data, b"m1");
        let m2 = data_segment("a", first_data + 1, b"m2");
        let m3 = data_segment("a", first_data + 2, b"m3");

        let ack = b.handle_received(m3.clone(), 0.0).pop().unwrap();
        assert_eq!(ack.body, SegmentBody::Ack(first_data - 1)); // gap: nothing new contiguous
        assert_eq!(b.get_received_messages(0.0).0, Vec::<Bytes>::new());

        b.handle_received(m2, 0.0);
        let ack = b.handle_received(m3, 0.0).pop().unwrap();
        assert_eq!(ack.body, SegmentBody::Ack(first_data - 1));

        let ack = b.handle_received(m1, 0.0).pop().unwrap();
        assert_eq!(ack.body, SegmentBody::Ack(first_data + 2));

        let (messages, _) = b.get_received_messages(0.0);
        assert_eq!(messages, vec![Bytes::from_static(b"m1"), Bytes::from_static(b"m2"), Bytes::from_static(b"m3")]);

        // draining again delivers nothing - exactly once
        assert_eq!(b.get_received_messages(0.0).0, Vec::<Bytes>::new());
    }

    #[test]
    fn test_duplicate_of_delivered_segment_is_acked_but_not_redelivered() {
        let (_, mut b) = established_pair();
        let first_data = b.next_sequence_to_receive;

        b.handle_received(data_segment("a", first_data, b"m1"), 0.0);
        assert_eq!(b.get_received_messages(0.0).0, vec![Bytes::from_static(b"m1")]);

        let ack = b.handle_received(data_segment("a", first_data, b"m1"), 0.0).pop().unwrap();
        assert_eq!(ack.body, SegmentBody::Ack(first_data));
        assert_eq!(b.get_received_messages(0.0).0, Vec::<Bytes>::new());
    }

    #[test]
    fn test_admission_control_drops_beyond_window() {
        let (_, mut b) = established_pair();
        let beyond = b.own_max_sequence + 1;

        let replies = b.handle_received(data_segment("a", beyond, b"nope"), 0.0);

        assert!(b.reorder_buffer.is_empty());
        // still acked cumulatively, just without the dropped segment
        assert_eq!(replies.len(), 1);
        assert!(matches!(replies[0].body, SegmentBody::Ack(_)));
    }

    #[test]
    fn test_retransmission_until_acked() {
        let (mut a, _) = established_pair();

        let segments = a.encapsulate_for_sending(Bytes::from_static(b"hello"), 1.0).unwrap();
        assert_eq!(segments.len(), 1);
        let sequence = segments[0].sequence;

        // before the initial timeout: nothing to do
        assert_eq!(a.act_on_timeout(1.1), TimeoutAction::Idle);

        // no ack for longer than the timeout: retransmit with refreshed timestamp
        match a.act_on_timeout(7.0) {
            TimeoutAction::Transmit(segment) => {
                assert_eq!(segment.sequence, sequence);
                assert_eq!(segment.time, 7.0);
            }
            other => panic!("expected retransmission, got {:?}", other),
        }

        // still unacked: the timer fires again
        assert!(matches!(a.act_on_timeout(12.0), TimeoutAction::Transmit(_)));

        // acked: gone from the retransmission queue for good
        a.handle_received(Segment {
            sequence: 0,
            time: 12.0,
            host: "b".to_string(),
            body: SegmentBody::Ack(sequence),
        }, 12.5);
        assert!(a.unacknowledged.is_empty());
        assert_eq!(a.act_on_timeout(13.0), TimeoutAction::Idle);
    }

    #[test]
    fn test_ack_takes_rtt_sample_from_echoed_timestamp() {
        let (mut a, _) = established_pair();

        let segments = a.encapsulate_for_sending(Bytes::from_static(b"x"), 10.0).unwrap();
        a.handle_received(Segment {
            sequence: 0,
            time: segments[0].time,
            host: "b".to_string(),
            body: SegmentBody::Ack(segments[0].sequence),
        }, 10.2);

        let expected = 0.2 + 4.0 * 0.1;
        assert!((a.rtt.retransmission_timeout() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_fast_retransmit_on_duplicate_ack() {
        let (mut a, _) = established_pair();
        let acked = a.other_max_ack;

        let s1 = a.encapsulate_for_sending(Bytes::from_static(b"m1"), 1.0).unwrap();
        a.encapsulate_for_sending(Bytes::from_static(b"m2"), 1.0).unwrap();
        let missing = s1[0].sequence;

        let dup = |t| Segment {
            sequence: 0,
            time: t,
            host: "b".to_string(),
            body: SegmentBody::Ack(acked),
        };
        // the repeated ack means the peer got m2 but not m1: retransmit m1 immediately
        let replies = a.handle_received(dup(1.0), 1.1);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].sequence, missing);
        assert!(matches!(replies[0].body, SegmentBody::Data(_)));
    }

    #[test]
    fn test_window_gates_data_segments() {
        let (mut a, _) = established_pair();
        a.other_max_sequence = a.next_sequence_to_send; // room for exactly one more segment

        let first = a.encapsulate_for_sending(Bytes::from_static(b"m1"), 0.0).unwrap();
        assert_eq!(first.len(), 1);

        // window exhausted: accepted but queued
        let second = a.encapsulate_for_sending(Bytes::from_static(b"m2"), 0.0).unwrap();
        assert!(second.is_empty());
        assert_eq!(a.send_queue.len(), 1);

        // a wider window advertisement releases the queued message
        let replies = a.handle_received(Segment {
            sequence: 2,
            time: 0.0,
            host: "b".to_string(),
            body: SegmentBody::Window(a.next_sequence_to_send + 10),
        }, 0.0);

        let data = replies.iter()
            .filter(|s| matches!(s.body, SegmentBody::Data(_)))
            .collect::<Vec<_>>();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].body, SegmentBody::Data(Bytes::from_static(b"m2")));
    }

    #[test]
    fn test_send_queue_full() {
        let (mut a, _) = established_pair();
        a.other_max_sequence = 0; // nothing admitted

        for _ in 0..4 {
            assert_eq!(a.encapsulate_for_sending(Bytes::from_static(b"m"), 0.0), Ok(vec![]));
        }
        assert!(!a.has_send_queue_room());
        assert_eq!(a.encapsulate_for_sending(Bytes::from_static(b"m"), 0.0), Err(SendQueueFull));
    }

    #[test]
    fn test_window_update_after_draining_enough() {
        let (_, mut b) = established_pair();
        b.segments_consumed_since_window_update = 0;
        let first_data = b.next_sequence_to_receive;
        let initial_edge = b.own_max_sequence;

        // threshold is 4: three consumed segments do not trigger an update
        for i in 0..3 {
            b.handle_received(data_segment("a", first_data + i, b"m"), 0.0);
        }
        let (messages, update) = b.get_received_messages(0.0);
        assert_eq!(messages.len(), 3);
        assert!(update.is_none());

        // the fourth does
        b.handle_received(data_segment("a", first_data + 3, b"m"), 0.0);
        let (messages, update) = b.get_received_messages(0.0);
        assert_eq!(messages.len(), 1);
        let update = update.unwrap();
        assert_eq!(update.body, SegmentBody::Window(initial_edge + 4));
        assert!(b.unacknowledged.contains_key(&update.sequence));
    }

    #[test]
    fn test_keep_alive_only_from_idle_initiator() {
        let (mut a, mut b) = established_pair();

        // not idle for long enough
        assert_eq!(a.act_on_timeout(4.0), TimeoutAction::Idle);

        // idle past the interval: the initiator emits a keep-alive
        match a.act_on_timeout(6.0) {
            TimeoutAction::Transmit(segment) => {
                assert_eq!(segment.body, SegmentBody::KeepAlive);
                assert!(a.unacknowledged.contains_key(&segment.sequence));
            }
            other => panic!("expected keep-alive, got {:?}", other),
        }

        // the accepting side stays quiet (receiving the keep-alive refreshed its timer)
        b.handle_received(data_segment("a", b.next_sequence_to_receive, b"m"), 6.0);
        assert_eq!(b.act_on_timeout(10.0), TimeoutAction::Idle);
    }

    #[test]
    fn test_peer_dead_after_keep_alive_timeout() {
        let (mut a, _) = established_pair();

        assert_ne!(a.act_on_timeout(14.9), TimeoutAction::PeerDead);
        assert_eq!(a.act_on_timeout(15.1), TimeoutAction::PeerDead);
    }

    #[rstest]
    #[case::keep_alive_due_first(true, 6.0)]
    #[case::peer_death_only_for_acceptor(false, 15.0)]
    fn test_time_until_next_timeout_idle(#[case] initiator: bool, #[case] expected_deadline: f64) {
        let mut a = Connection::new("a".to_string(), initiator, test_config(), 0.0);
        a.last_sent_time = 1.0;
        a.last_received_time = 0.0;

        let expected = expected_deadline - 2.0;
        assert!((a.time_until_next_timeout(2.0).as_secs_f64() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_time_until_next_timeout_retransmission_deadline() {
        let (mut a, _) = established_pair();
        a.encapsulate_for_sending(Bytes::from_static(b"m"), 1.0).unwrap();

        // initial timeout is 5s, sent at t=1, asking at t=2
        assert!((a.time_until_next_timeout(2.0).as_secs_f64() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_until_next_timeout_clamps_to_floor() {
        let (mut a, _) = established_pair();
        a.encapsulate_for_sending(Bytes::from_static(b"m"), 0.0).unwrap();

        // deadline long past: still a positive floor, never a busy-wait
        assert_eq!(a.time_until_next_timeout(100.0), Duration::from_millis(50));
    }

    #[test]
    fn test_close_handshake() {
        let (mut a, mut b) = established_pair();

        let close_a = a.close(1.0).unwrap();
        assert_eq!(close_a.body, SegmentBody::Close);
        assert!(!a.is_closed());
        assert!(!a.is_connected());

        // b answers with its own close plus an ack of a's
        let replies = b.handle_received(close_a, 1.0);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].body, SegmentBody::Close);
        assert!(matches!(replies[1].body, SegmentBody::Ack(_)));
        assert!(!b.is_closed());

        let a_replies = replies.into_iter()
            .flat_map(|s| a.handle_received(s, 1.0))
            .collect::<Vec<_>>();
        assert!(a.is_closed());

        // a's ack of b's close completes b as well
        for segment in a_replies {
            b.handle_received(segment, 1.0);
        }
        assert!(b.is_closed());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut a, _) = established_pair();

        assert!(a.close(1.0).is_some());
        assert!(a.close(1.0).is_none());
        assert!(a.close(2.0).is_none());
    }

    #[test]
    fn test_close_waits_for_outstanding_data() {
        let (mut a, _) = established_pair();
        let segments = a.encapsulate_for_sending(Bytes::from_static(b"m"), 0.0).unwrap();

        // outstanding data: not yet
        assert!(a.close(0.5).is_none());

        // once everything is acked, close goes out
        a.handle_received(Segment {
            sequence: 0,
            time: 0.0,
            host: "b".to_string(),
            body: SegmentBody::Ack(segments[0].sequence),
        }, 0.6);
        assert!(a.close(0.7).is_some());
    }

    #[test]
    fn test_close_interleaved_with_data_still_delivers() {
        let (mut a, mut b) = established_pair();

        let data = a.encapsulate_for_sending(Bytes::from_static(b"last words"), 0.0).unwrap();
        let close = {
            // ack the data so close() is willing to fire, but deliver the data later
            let ack = Segment {
                sequence: 0,
                time: 0.0,
                host: "b".to_string(),
                body: SegmentBody::Ack(data[0].sequence),
            };
            a.handle_received(ack, 0.1);
            a.close(0.2).unwrap()
        };

        // close arrives before the data it follows
        b.handle_received(close, 0.3);
        assert_eq!(b.get_received_messages(0.3).0, Vec::<Bytes>::new());

        b.handle_received(data.into_iter().next().unwrap(), 0.4);
        let (messages, _) = b.get_received_messages(0.4);
        assert_eq!(messages, vec![Bytes::from_static(b"last words")]);
    }
}
