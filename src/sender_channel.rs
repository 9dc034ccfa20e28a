//! Send side of the per-channel reliability machinery.
//!
//! Application messages are enqueued in submission order; a send pass assigns sequence
//!  numbers and emits [SendItem]s for the connection to pack into datagrams. The reliable
//!  variant runs Selective-Repeat ARQ: sent messages stay stored in a fixed window until
//!  acknowledged, are retransmitted on a resend timer, and holes in the acknowledged
//!  sequence trigger an eager retransmit.

use crate::message::{MessageType, WirePayload};
use crate::seq::{BitVector, SeqNr, NUM_SEQUENCE_NUMBERS};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Sender windows hold at most this many unacknowledged messages in flight.
pub(crate) const WINDOW_SIZE: u16 = 64;

/// A message scheduled for transmission in the current pass, ready to be encoded.
#[derive(Clone)]
pub(crate) struct SendItem {
    pub msg_type: MessageType,
    pub sequence: SeqNr,
    pub payload: Arc<WirePayload>,
}

/// Result of processing one acknowledgement.
#[derive(Default, Debug, PartialEq, Eq)]
pub(crate) struct AckResult {
    /// an un-resent message was acked promptly - a trustworthy liveness signal that resets
    ///  the connection timeout
    pub good_rtt_sample: bool,
    pub resent: u64,
}

pub(crate) enum SenderChannel {
    Stateless(StatelessSender),
    Reliable(ReliableSender),
}

impl SenderChannel {
    pub fn new_for(msg_type: MessageType) -> SenderChannel {
        match msg_type {
            MessageType::User(delivery, _) if delivery.is_reliable() => {
                SenderChannel::Reliable(ReliableSender::new(msg_type))
            }
            _ => SenderChannel::Stateless(StatelessSender::new(msg_type)),
        }
    }

    pub fn enqueue(&mut self, payload: Arc<WirePayload>) {
        match self {
            SenderChannel::Stateless(s) => s.queued.push_back(payload),
            SenderChannel::Reliable(s) => s.queued.push_back(payload),
        }
    }

    pub fn send_queued(
        &mut self,
        now: Instant,
        resend_delay: Duration,
        out: &mut Vec<SendItem>,
    ) -> u64 {
        match self {
            SenderChannel::Stateless(s) => {
                s.send_queued(out);
                0
            }
            SenderChannel::Reliable(s) => s.send_queued(now, resend_delay, out),
        }
    }

    pub fn receive_ack(
        &mut self,
        now: Instant,
        seq: SeqNr,
        resend_delay: Duration,
        out: &mut Vec<SendItem>,
    ) -> AckResult {
        match self {
            // stateless channels never expect acks; tolerate and ignore them
            SenderChannel::Stateless(_) => AckResult::default(),
            SenderChannel::Reliable(s) => s.receive_ack(now, seq, resend_delay, out),
        }
    }

    pub fn queued_count(&self) -> usize {
        match self {
            SenderChannel::Stateless(s) => s.queued.len(),
            SenderChannel::Reliable(s) => s.queued.len(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            SenderChannel::Stateless(s) => {
                s.queued.clear();
                s.next_seq = SeqNr::ZERO;
            }
            SenderChannel::Reliable(s) => {
                s.queued.clear();
                s.stored.iter_mut().for_each(|slot| *slot = None);
                s.acked.clear_all();
                s.window_start = SeqNr::ZERO;
                s.send_start = SeqNr::ZERO;
            }
        }
    }
}

/// Unreliable and unreliable-sequenced sending: every pass drains the queue completely,
///  nothing is stored. Sequence numbers are assigned either way; the sequenced receiver uses
///  them to drop late arrivals, the plain unreliable receiver ignores them.
pub(crate) struct StatelessSender {
    msg_type: MessageType,
    queued: VecDeque<Arc<WirePayload>>,
    next_seq: SeqNr,
}

impl StatelessSender {
    fn new(msg_type: MessageType) -> StatelessSender {
        StatelessSender {
            msg_type,
            queued: VecDeque::new(),
            next_seq: SeqNr::ZERO,
        }
    }

    fn send_queued(&mut self, out: &mut Vec<SendItem>) {
        while let Some(payload) = self.queued.pop_front() {
            let sequence = self.next_seq;
            self.next_seq = self.next_seq.next();
            out.push(SendItem {
                msg_type: self.msg_type,
                sequence,
                payload,
            });
        }
    }
}

struct StoredMessage {
    payload: Arc<WirePayload>,
    sequence: SeqNr,
    last_sent: Instant,
    num_sent: u32,
}

/// Selective-Repeat sender shared by all three reliable delivery classes.
pub(crate) struct ReliableSender {
    msg_type: MessageType,
    queued: VecDeque<Arc<WirePayload>>,

    /// oldest unacknowledged sequence
    window_start: SeqNr,
    /// next sequence to be assigned
    send_start: SeqNr,
    /// slot `seq % WINDOW_SIZE` is occupied iff `seq` is in `[window_start, send_start)`
    stored: Vec<Option<StoredMessage>>,
    /// acks received ahead of `window_start`, indexed by raw sequence number
    acked: BitVector,
}

impl ReliableSender {
    fn new(msg_type: MessageType) -> ReliableSender {
        ReliableSender {
            msg_type,
            queued: VecDeque::new(),
            window_start: SeqNr::ZERO,
            send_start: SeqNr::ZERO,
            stored: (0..WINDOW_SIZE).map(|_| None).collect(),
            acked: BitVector::new(NUM_SEQUENCE_NUMBERS as usize),
        }
    }

    fn allowed_sends(&self) -> u16 {
        let in_flight = self.send_start.relative_to(self.window_start);
        debug_assert!((0..=WINDOW_SIZE as i16).contains(&in_flight));
        WINDOW_SIZE - in_flight as u16
    }

    fn slot(&mut self, seq: SeqNr) -> &mut Option<StoredMessage> {
        &mut self.stored[(seq.to_raw() % WINDOW_SIZE) as usize]
    }

    fn send_queued(
        &mut self,
        now: Instant,
        resend_delay: Duration,
        out: &mut Vec<SendItem>,
    ) -> u64 {
        let mut resent = 0;

        // first re-emit everything whose resend timer expired
        let mut seq = self.window_start;
        while seq != self.send_start {
            let msg_type = self.msg_type;
            if let Some(stored) = self.slot(seq).as_mut() {
                if now.duration_since(stored.last_sent) > resend_delay {
                    trace!("resending {:?} on {:?} after resend delay", seq, msg_type);
                    stored.last_sent = now;
                    stored.num_sent += 1;
                    resent += 1;
                    out.push(SendItem {
                        msg_type,
                        sequence: stored.sequence,
                        payload: stored.payload.clone(),
                    });
                }
            }
            seq = seq.next();
        }

        // then admit fresh messages as far as the window allows
        let mut allowed = self.allowed_sends();
        while allowed > 0 {
            let Some(payload) = self.queued.pop_front() else {
                break;
            };

            let sequence = self.send_start;
            self.send_start = self.send_start.next();
            allowed -= 1;

            out.push(SendItem {
                msg_type: self.msg_type,
                sequence,
                payload: payload.clone(),
            });

            let slot = self.slot(sequence);
            debug_assert!(slot.is_none(), "window slot must be free");
            *slot = Some(StoredMessage {
                payload,
                sequence,
                last_sent: now,
                num_sent: 1,
            });
        }

        resent
    }

    fn receive_ack(
        &mut self,
        now: Instant,
        seq: SeqNr,
        resend_delay: Duration,
        out: &mut Vec<SendItem>,
    ) -> AckResult {
        let mut result = AckResult::default();
        let rel = seq.relative_to(self.window_start);

        if rel < 0 {
            // ack for something already passed out of the window - duplicate or very late
            trace!("stale ack {:?} on {:?}", seq, self.msg_type);
            return result;
        }
        if rel >= self.send_start.relative_to(self.window_start) {
            // ack for a sequence that was never sent; ignore rather than let it corrupt
            //  the window
            trace!("ack {:?} beyond the send window on {:?}", seq, self.msg_type);
            return result;
        }

        if rel == 0 {
            // expected case: the window edge is acknowledged and slides forward over any
            //  sequences that were acked early
            result.good_rtt_sample |= self.destore(self.window_start, now);
            self.acked.clear(self.window_start.to_raw() as usize);
            self.window_start = self.window_start.next();

            while self.acked.get(self.window_start.to_raw() as usize) {
                result.good_rtt_sample |= self.destore(self.window_start, now);
                self.acked.clear(self.window_start.to_raw() as usize);
                self.window_start = self.window_start.next();
            }
            return result;
        }

        // early ack: remember it, and treat the unacked sequences before it as holes that
        //  warrant an eager retransmit
        self.acked.set(seq.to_raw() as usize);

        let hole_delay = resend_delay.mul_f32(0.35);
        let mut hole = self.window_start;
        while hole != seq {
            if !self.acked.get(hole.to_raw() as usize) {
                let msg_type = self.msg_type;
                if let Some(stored) = self.slot(hole).as_mut() {
                    if stored.num_sent == 1 && now.duration_since(stored.last_sent) >= hole_delay {
                        trace!("early ack {:?}: retransmitting hole {:?} on {:?}", seq, hole, msg_type);
                        stored.last_sent = now;
                        stored.num_sent += 1;
                        result.resent += 1;
                        out.push(SendItem {
                            msg_type,
                            sequence: stored.sequence,
                            payload: stored.payload.clone(),
                        });
                    }
                }
            }
            hole = hole.next();
        }

        result
    }

    /// Free the window slot of `seq`. Returns true when the acked message is a good RTT
    ///  sample (single transmission, acked within 2 seconds).
    fn destore(&mut self, seq: SeqNr, now: Instant) -> bool {
        match self.slot(seq).take() {
            Some(stored) => {
                debug_assert_eq!(stored.sequence, seq);
                // dropping the Arc releases the payload once the last in-flight clone is gone
                stored.num_sent == 1
                    && now.duration_since(stored.last_sent) < Duration::from_secs(2)
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DeliveryMethod;
    use rstest::rstest;

    const RESEND_DELAY: Duration = Duration::from_millis(100);

    fn payload(marker: u8) -> Arc<WirePayload> {
        WirePayload::new(vec![marker], 8)
    }

    fn reliable() -> SenderChannel {
        SenderChannel::new_for(MessageType::User(DeliveryMethod::ReliableOrdered, 0))
    }

    fn sent_seqs(out: &[SendItem]) -> Vec<u16> {
        out.iter().map(|item| item.sequence.to_raw()).collect()
    }

    #[test]
    fn test_stateless_drains_with_increasing_seqs() {
        let mut channel =
            SenderChannel::new_for(MessageType::User(DeliveryMethod::UnreliableSequenced, 3));
        for i in 0..5 {
            channel.enqueue(payload(i));
        }

        let mut out = Vec::new();
        channel.send_queued(Instant::now(), RESEND_DELAY, &mut out);
        assert_eq!(sent_seqs(&out), vec![0, 1, 2, 3, 4]);
        assert_eq!(channel.queued_count(), 0);

        // next pass continues the numbering
        channel.enqueue(payload(9));
        out.clear();
        channel.send_queued(Instant::now(), RESEND_DELAY, &mut out);
        assert_eq!(sent_seqs(&out), vec![5]);
    }

    #[test]
    fn test_reliable_window_limits_in_flight() {
        let mut channel = reliable();
        for i in 0..80 {
            channel.enqueue(payload(i));
        }

        let mut out = Vec::new();
        channel.send_queued(Instant::now(), RESEND_DELAY, &mut out);
        assert_eq!(out.len(), WINDOW_SIZE as usize);
        assert_eq!(channel.queued_count(), 80 - WINDOW_SIZE as usize);

        // nothing more goes out until the window opens
        out.clear();
        channel.send_queued(Instant::now(), RESEND_DELAY, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_ack_advances_window_and_admits_more() {
        let mut channel = reliable();
        for i in 0..70 {
            channel.enqueue(payload(i));
        }
        let now = Instant::now();
        let mut out = Vec::new();
        channel.send_queued(now, RESEND_DELAY, &mut out);
        out.clear();

        let result = channel.receive_ack(now, SeqNr::ZERO, RESEND_DELAY, &mut out);
        assert!(result.good_rtt_sample);
        assert!(out.is_empty());

        channel.send_queued(now, RESEND_DELAY, &mut out);
        assert_eq!(sent_seqs(&out), vec![64]);
    }

    #[test]
    fn test_early_acks_collapse_on_window_edge() {
        let mut channel = reliable();
        for i in 0..5 {
            channel.enqueue(payload(i));
        }
        let now = Instant::now();
        let mut out = Vec::new();
        channel.send_queued(now, RESEND_DELAY, &mut out);
        out.clear();

        // acks 1..4 arrive before 0 - window must not move yet
        for seq in 1..5u16 {
            channel.receive_ack(now, SeqNr::from_raw(seq), RESEND_DELAY, &mut out);
        }
        let SenderChannel::Reliable(inner) = &channel else {
            unreachable!()
        };
        assert_eq!(inner.window_start, SeqNr::ZERO);

        // ack of 0 slides the window over all early acks at once
        channel.receive_ack(now, SeqNr::ZERO, RESEND_DELAY, &mut out);
        let SenderChannel::Reliable(inner) = &channel else {
            unreachable!()
        };
        assert_eq!(inner.window_start, SeqNr::from_raw(5));
        assert_eq!(inner.allowed_sends(), WINDOW_SIZE);
        assert!(inner.stored.iter().all(|slot| slot.is_none()));
    }

    #[test]
    fn test_early_ack_triggers_hole_retransmit() {
        let mut channel = reliable();
        for i in 0..3 {
            channel.enqueue(payload(i));
        }
        let send_time = Instant::now();
        let mut out = Vec::new();
        channel.send_queued(send_time, RESEND_DELAY, &mut out);
        out.clear();

        // the ack for 2 arrives while 0 and 1 are still pending and stale enough
        let ack_time = send_time + RESEND_DELAY.mul_f32(0.5);
        let result = channel.receive_ack(ack_time, SeqNr::from_raw(2), RESEND_DELAY, &mut out);
        assert_eq!(result.resent, 2);
        assert_eq!(sent_seqs(&out), vec![0, 1]);

        // replaying the same ack must not resend again (num_sent is no longer 1)
        out.clear();
        let result = channel.receive_ack(ack_time, SeqNr::from_raw(2), RESEND_DELAY, &mut out);
        assert_eq!(result.resent, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_early_ack_respects_hole_grace_period() {
        let mut channel = reliable();
        channel.enqueue(payload(0));
        channel.enqueue(payload(1));
        let send_time = Instant::now();
        let mut out = Vec::new();
        channel.send_queued(send_time, RESEND_DELAY, &mut out);
        out.clear();

        // ack arrives almost immediately: too early to suspect a lost packet
        let ack_time = send_time + Duration::from_millis(1);
        channel.receive_ack(ack_time, SeqNr::from_raw(1), RESEND_DELAY, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_resend_after_delay() {
        let mut channel = reliable();
        channel.enqueue(payload(0));
        let send_time = Instant::now();
        let mut out = Vec::new();
        channel.send_queued(send_time, RESEND_DELAY, &mut out);
        out.clear();

        // before the delay: nothing
        let resent = channel.send_queued(send_time + Duration::from_millis(50), RESEND_DELAY, &mut out);
        assert_eq!(resent, 0);
        assert!(out.is_empty());

        // after the delay: the stored message goes out again with the same sequence
        let resent = channel.send_queued(send_time + Duration::from_millis(150), RESEND_DELAY, &mut out);
        assert_eq!(resent, 1);
        assert_eq!(sent_seqs(&out), vec![0]);

        // a resent message is no longer a good RTT sample
        out.clear();
        let result = channel.receive_ack(
            send_time + Duration::from_millis(200),
            SeqNr::ZERO,
            RESEND_DELAY,
            &mut out,
        );
        assert!(!result.good_rtt_sample);
    }

    #[rstest]
    #[case::stale_ack(SeqNr::from_raw(32767))]
    #[case::far_future_ack(SeqNr::from_raw(100))]
    fn test_out_of_window_acks_are_ignored(#[case] ack: SeqNr) {
        let mut channel = reliable();
        channel.enqueue(payload(0));
        let now = Instant::now();
        let mut out = Vec::new();
        channel.send_queued(now, RESEND_DELAY, &mut out);
        out.clear();

        let result = channel.receive_ack(now, ack, RESEND_DELAY, &mut out);
        assert_eq!(result, AckResult::default());
        assert!(out.is_empty());

        let SenderChannel::Reliable(inner) = &channel else {
            unreachable!()
        };
        assert_eq!(inner.window_start, SeqNr::ZERO);
        assert!(inner.stored[0].is_some());
    }

    #[test]
    fn test_sequence_numbers_wrap_cleanly() {
        let mut channel = reliable();

        // pretend a long-lived channel close to the wrap point
        if let SenderChannel::Reliable(inner) = &mut channel {
            inner.window_start = SeqNr::from_raw(32766);
            inner.send_start = SeqNr::from_raw(32766);
        }

        for i in 0..4 {
            channel.enqueue(payload(i));
        }
        let now = Instant::now();
        let mut out = Vec::new();
        channel.send_queued(now, RESEND_DELAY, &mut out);
        assert_eq!(sent_seqs(&out), vec![32766, 32767, 0, 1]);

        out.clear();
        for seq in [32766u16, 32767, 0, 1] {
            channel.receive_ack(now, SeqNr::from_raw(seq), RESEND_DELAY, &mut out);
        }

        let SenderChannel::Reliable(inner) = &channel else {
            unreachable!()
        };
        assert_eq!(inner.window_start, SeqNr::from_raw(2));
        assert_eq!(inner.allowed_sends(), WINDOW_SIZE);
    }

    #[test]
    fn test_payload_released_once_fully_acked() {
        let mut channel = reliable();
        let p = payload(0);
        let weak = Arc::downgrade(&p);
        channel.enqueue(p);

        let now = Instant::now();
        let mut out = Vec::new();
        channel.send_queued(now, RESEND_DELAY, &mut out);
        out.clear();
        assert!(weak.upgrade().is_some());

        channel.receive_ack(now, SeqNr::ZERO, RESEND_DELAY, &mut out);
        assert!(weak.upgrade().is_none(), "payload must be released on destore");
    }
}
