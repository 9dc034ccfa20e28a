//! Receive side of the per-channel machinery: duplicate suppression, the reorder buffer for
//!  ordered channels, and acknowledgement emission.
//!
//! Receivers never touch the socket; acks are appended to the connection's pending-ack list
//!  as `(message type tag, sequence)` pairs and packed into Acknowledge datagrams by the
//!  connection heartbeat.

use crate::message::{DeliveryMethod, IncomingMessage, MessageType};
use crate::seq::{BitVector, SeqNr, NUM_SEQUENCE_NUMBERS};
use tracing::trace;

/// Reorder buffer size of the ordered receiver, matching the sender window.
pub(crate) const RECEIVE_WINDOW_SIZE: u16 = crate::sender_channel::WINDOW_SIZE;

pub(crate) enum ReceiverChannel {
    Unreliable,
    Sequenced(SequencedReceiver),
    ReliableUnordered(ReliableUnorderedReceiver),
    ReliableSequenced(ReliableSequencedReceiver),
    ReliableOrdered(OrderedReceiver),
}

impl ReceiverChannel {
    pub fn new_for(msg_type: MessageType) -> ReceiverChannel {
        let tag = msg_type.tag();
        match msg_type {
            MessageType::User(DeliveryMethod::UnreliableSequenced, _) => {
                ReceiverChannel::Sequenced(SequencedReceiver { last_accepted: None })
            }
            MessageType::User(DeliveryMethod::ReliableUnordered, _) => {
                ReceiverChannel::ReliableUnordered(ReliableUnorderedReceiver {
                    tag,
                    window_start: SeqNr::ZERO,
                    seen: BitVector::new(NUM_SEQUENCE_NUMBERS as usize),
                })
            }
            MessageType::User(DeliveryMethod::ReliableSequenced, _) => {
                ReceiverChannel::ReliableSequenced(ReliableSequencedReceiver {
                    tag,
                    last_accepted: None,
                })
            }
            MessageType::User(DeliveryMethod::ReliableOrdered, _) => {
                ReceiverChannel::ReliableOrdered(OrderedReceiver {
                    tag,
                    window_start: SeqNr::ZERO,
                    withheld: (0..RECEIVE_WINDOW_SIZE).map(|_| None).collect(),
                })
            }
            _ => ReceiverChannel::Unreliable,
        }
    }

    /// Route one arrived message. Returns `true` when the message was dropped as a duplicate
    ///  or out-of-window arrival.
    pub fn receive(
        &mut self,
        seq: SeqNr,
        msg: IncomingMessage,
        acks: &mut Vec<(u8, SeqNr)>,
        released: &mut Vec<IncomingMessage>,
    ) -> bool {
        match self {
            ReceiverChannel::Unreliable => {
                released.push(msg);
                false
            }
            ReceiverChannel::Sequenced(r) => r.receive(seq, msg, released),
            ReceiverChannel::ReliableUnordered(r) => r.receive(seq, msg, acks, released),
            ReceiverChannel::ReliableSequenced(r) => r.receive(seq, msg, acks, released),
            ReceiverChannel::ReliableOrdered(r) => r.receive(seq, msg, acks, released),
        }
    }
}

/// Accepts only strictly newer sequences; no acks, no buffering.
pub(crate) struct SequencedReceiver {
    last_accepted: Option<SeqNr>,
}

impl SequencedReceiver {
    fn receive(
        &mut self,
        seq: SeqNr,
        msg: IncomingMessage,
        released: &mut Vec<IncomingMessage>,
    ) -> bool {
        match self.last_accepted {
            Some(last) if seq.relative_to(last) <= 0 => {
                trace!("dropping late sequenced message {:?} (last accepted {:?})", seq, last);
                true
            }
            _ => {
                self.last_accepted = Some(seq);
                released.push(msg);
                false
            }
        }
    }
}

/// Same acceptance rule as [SequencedReceiver], but every arrival is acknowledged so the
///  sender can clear its window - including late duplicates.
pub(crate) struct ReliableSequencedReceiver {
    tag: u8,
    last_accepted: Option<SeqNr>,
}

impl ReliableSequencedReceiver {
    fn receive(
        &mut self,
        seq: SeqNr,
        msg: IncomingMessage,
        acks: &mut Vec<(u8, SeqNr)>,
        released: &mut Vec<IncomingMessage>,
    ) -> bool {
        acks.push((self.tag, seq));

        match self.last_accepted {
            Some(last) if seq.relative_to(last) <= 0 => true,
            _ => {
                self.last_accepted = Some(seq);
                released.push(msg);
                false
            }
        }
    }
}

/// Delivers immediately in arrival order; the bit set suppresses duplicates until the window
///  edge passes over them.
pub(crate) struct ReliableUnorderedReceiver {
    tag: u8,
    /// lowest sequence not yet seen
    window_start: SeqNr,
    seen: BitVector,
}

impl ReliableUnorderedReceiver {
    fn receive(
        &mut self,
        seq: SeqNr,
        msg: IncomingMessage,
        acks: &mut Vec<(u8, SeqNr)>,
        released: &mut Vec<IncomingMessage>,
    ) -> bool {
        acks.push((self.tag, seq));

        let rel = seq.relative_to(self.window_start);
        if rel < 0 {
            trace!("dropping duplicate reliable-unordered message {:?}", seq);
            return true;
        }

        if rel == 0 {
            self.window_start = self.window_start.next();
            while self.seen.get(self.window_start.to_raw() as usize) {
                self.seen.clear(self.window_start.to_raw() as usize);
                self.window_start = self.window_start.next();
            }
            released.push(msg);
            return false;
        }

        if self.seen.get(seq.to_raw() as usize) {
            trace!("dropping duplicate reliable-unordered message {:?}", seq);
            return true;
        }
        self.seen.set(seq.to_raw() as usize);
        released.push(msg);
        false
    }
}

/// Releases messages in strictly ascending sequence order, withholding early arrivals until
///  the gap before them fills.
pub(crate) struct OrderedReceiver {
    tag: u8,
    /// next sequence to release
    window_start: SeqNr,
    withheld: Vec<Option<IncomingMessage>>,
}

impl OrderedReceiver {
    fn receive(
        &mut self,
        seq: SeqNr,
        msg: IncomingMessage,
        acks: &mut Vec<(u8, SeqNr)>,
        released: &mut Vec<IncomingMessage>,
    ) -> bool {
        // ack unconditionally - also for duplicates, since the first ack may have been lost
        acks.push((self.tag, seq));

        let rel = seq.relative_to(self.window_start);
        if rel < 0 || rel >= RECEIVE_WINDOW_SIZE as i16 {
            // already released, or so far ahead that it can only be a duplicate of a
            //  wrapped-around sequence
            trace!("dropping out-of-window ordered message {:?} (window starts at {:?})", seq, self.window_start);
            return true;
        }

        if rel == 0 {
            released.push(msg);
            self.window_start = self.window_start.next();

            // release everything that was withheld behind the gap
            loop {
                let slot = (self.window_start.to_raw() % RECEIVE_WINDOW_SIZE) as usize;
                match self.withheld[slot].take() {
                    Some(withheld) => {
                        released.push(withheld);
                        self.window_start = self.window_start.next();
                    }
                    None => break,
                }
            }
            return false;
        }

        // early arrival: park it until the gap fills
        let slot = (seq.to_raw() % RECEIVE_WINDOW_SIZE) as usize;
        if self.withheld[slot].is_some() {
            trace!("dropping duplicate withheld ordered message {:?}", seq);
            return true;
        }
        self.withheld[slot] = Some(msg);
        false
    }
}
