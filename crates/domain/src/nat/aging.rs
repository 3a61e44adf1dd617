//! Deadline-ordered timeout queues and the TCP state machine that picks
//! a session's queue.
//!
//! Every queue has a single TTL, so appending at the tail with
//! `now + ttl` keeps it sorted as long as `now` never goes backwards.
//! The expiry sweep therefore stops at the first live entry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::entity::{AgeOverride, SessionId};
use super::packet::{TCP_ACK, TCP_FIN, TCP_RST, TCP_SYN};
use super::rules::RuleKey;

const TCP_PUSH: u8 = 0x08;
const TCP_ECE: u8 = 0x40;
const TCP_CWR: u8 = 0x80;
const TCP_OPENING: u8 = TCP_SYN | TCP_ACK;
const TCP_ACKMASK: u8 = TCP_FIN | TCP_SYN | TCP_RST | TCP_ACK;

// ── Timeouts ────────────────────────────────────────────────────────

/// Idle timeouts in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatTimeouts {
    /// Listen, SYN sent/received, half-established, closing, time-wait
    /// and fin-wait-2.
    pub tcp_timeout: u64,
    pub tcp_established: u64,
    /// Close-wait and fin-wait-1.
    pub tcp_half_closed: u64,
    /// Last-ack, also used for closed.
    pub tcp_last_ack: u64,
    pub udp: u64,
    pub icmp: u64,
    pub ip: u64,
}

impl Default for NatTimeouts {
    fn default() -> Self {
        Self {
            tcp_timeout: 240,
            tcp_established: 432_000,
            tcp_half_closed: 7200,
            tcp_last_ack: 240,
            udp: 600,
            icmp: 3,
            ip: 60,
        }
    }
}

impl NatTimeouts {
    /// TTL of the queue for a TCP state, never shorter than the ICMP TTL.
    pub fn tcp(&self, state: TcpState) -> u64 {
        let ttl = match state {
            TcpState::Closed | TcpState::LastAck => self.tcp_last_ack,
            TcpState::Established => self.tcp_established,
            TcpState::CloseWait | TcpState::FinWait1 => self.tcp_half_closed,
            TcpState::Listen
            | TcpState::SynSent
            | TcpState::SynReceived
            | TcpState::HalfEstablished
            | TcpState::Closing
            | TcpState::FinWait2
            | TcpState::TimeWait => self.tcp_timeout,
        };
        ttl.max(self.icmp)
    }
}

// ── TCP state machine ───────────────────────────────────────────────

/// Per-direction TCP state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TcpState {
    #[default]
    Closed = 0,
    Listen = 1,
    SynSent = 2,
    SynReceived = 3,
    HalfEstablished = 4,
    Established = 5,
    CloseWait = 6,
    FinWait1 = 7,
    Closing = 8,
    LastAck = 9,
    FinWait2 = 10,
    TimeWait = 11,
}

impl TcpState {
    pub const ALL: [Self; 12] = [
        Self::Closed,
        Self::Listen,
        Self::SynSent,
        Self::SynReceived,
        Self::HalfEstablished,
        Self::Established,
        Self::CloseWait,
        Self::FinWait1,
        Self::Closing,
        Self::LastAck,
        Self::FinWait2,
        Self::TimeWait,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(usize::from(v)).copied()
    }
}

/// Outcome of feeding one segment to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpStep {
    /// Flags make no sense for the current state; nothing changes.
    Ignored,
    /// Valid segment that must not push the deadline out.
    Hold,
    /// Move the sending side to this state and refresh its deadline.
    Advance(TcpState),
}

/// Advance the state of side `rev` (0: creation direction, 1: reverse)
/// for a segment with `flags` and `data_len` payload bytes.
pub fn tcp_step(states: [TcpState; 2], rev: usize, flags: u8, data_len: usize) -> TcpStep {
    use TcpState::*;

    if flags & TCP_RST != 0 {
        let next = if flags & TCP_PUSH == 0 && data_len == 0 {
            Closed
        } else {
            CloseWait
        };
        return TcpStep::Advance(next);
    }

    let other = states[1 - rev];
    let current = states[rev];
    let advance = TcpStep::Advance;

    match current {
        Closed => {
            let mut step = if flags & TCP_OPENING == TCP_OPENING {
                advance(SynReceived)
            } else if flags & TCP_OPENING == TCP_SYN {
                advance(SynSent)
            } else {
                TcpStep::Ignored
            };
            // Pick up connections that were established before we saw them.
            if flags & TCP_ACKMASK == TCP_ACK {
                step = match other {
                    Closed | SynReceived => advance(HalfEstablished),
                    HalfEstablished | Established => advance(Established),
                    _ => step,
                };
            }
            step
        }
        SynSent => {
            if flags & !(TCP_ECE | TCP_CWR) == TCP_SYN {
                TcpStep::Hold
            } else if flags & (TCP_SYN | TCP_FIN | TCP_ACK) == TCP_ACK {
                advance(Established)
            } else if flags & TCP_FIN != 0 {
                advance(FinWait1)
            } else if flags & TCP_OPENING == TCP_OPENING {
                advance(SynReceived)
            } else {
                TcpStep::Ignored
            }
        }
        SynReceived => {
            if flags & (TCP_SYN | TCP_FIN | TCP_ACK) == TCP_ACK {
                advance(Established)
            } else if flags & !(TCP_ECE | TCP_CWR) == TCP_OPENING {
                TcpStep::Hold
            } else if flags & TCP_FIN != 0 {
                advance(FinWait1)
            } else {
                TcpStep::Ignored
            }
        }
        HalfEstablished => {
            if flags & TCP_FIN != 0 {
                advance(FinWait1)
            } else if flags & TCP_ACKMASK == TCP_ACK {
                match other {
                    Closed | SynSent | SynReceived => advance(HalfEstablished),
                    HalfEstablished | Established => advance(Established),
                    _ => TcpStep::Ignored,
                }
            } else {
                TcpStep::Ignored
            }
        }
        Established => {
            if flags & TCP_FIN != 0 {
                advance(FinWait1)
            } else if flags & TCP_ACK != 0 && other == FinWait1 {
                advance(CloseWait)
            } else {
                advance(Established)
            }
        }
        CloseWait => {
            if flags & TCP_FIN != 0 {
                advance(LastAck)
            } else {
                advance(CloseWait)
            }
        }
        FinWait1 => {
            if flags & TCP_ACK != 0 && other > CloseWait {
                advance(TimeWait)
            } else {
                advance(FinWait1)
            }
        }
        LastAck => {
            if flags & TCP_ACK == 0 {
                TcpStep::Ignored
            } else if flags & TCP_PUSH != 0 || data_len > 0 {
                advance(LastAck)
            } else {
                TcpStep::Hold
            }
        }
        FinWait2 => {
            if flags & TCP_OPENING == TCP_OPENING {
                advance(SynReceived)
            } else if flags & TCP_SYN != 0 {
                advance(SynSent)
            } else {
                advance(FinWait2)
            }
        }
        TimeWait => advance(TimeWait),
        Listen | Closing => TcpStep::Ignored,
    }
}

// ── Queues ──────────────────────────────────────────────────────────

/// Identity of a timeout queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueId {
    Tcp(TcpState),
    Udp,
    Icmp,
    Ip,
    /// A rule's own queue for one direction (0: forward, 1: reverse).
    Rule(RuleKey, usize),
}

#[derive(Debug, Clone)]
struct Queue {
    ttl: u64,
    head: Option<SessionId>,
    tail: Option<SessionId>,
    len: usize,
}

impl Queue {
    fn new(ttl: u64) -> Self {
        Self {
            ttl,
            head: None,
            tail: None,
            len: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    queue: QueueId,
    die: u64,
    prev: Option<SessionId>,
    next: Option<SessionId>,
    tcp: [TcpState; 2],
}

/// How a packet refreshes its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeUpdate {
    /// The rule carries its own timeouts.
    Rule(RuleKey, usize),
    /// Run the TCP state machine for side `rev`.
    Tcp { rev: usize, flags: u8, data_len: usize },
    /// Fixed class queue.
    Class(QueueId),
}

/// All timeout queues and the position of every session in them.
#[derive(Debug)]
pub struct AgingQueues {
    timeouts: NatTimeouts,
    queues: HashMap<QueueId, Queue>,
    entries: HashMap<SessionId, Entry>,
}

impl AgingQueues {
    pub fn new(timeouts: NatTimeouts) -> Self {
        let mut queues = HashMap::new();
        for state in TcpState::ALL {
            queues.insert(QueueId::Tcp(state), Queue::new(timeouts.tcp(state)));
        }
        queues.insert(QueueId::Udp, Queue::new(timeouts.udp));
        queues.insert(QueueId::Icmp, Queue::new(timeouts.icmp));
        queues.insert(QueueId::Ip, Queue::new(timeouts.ip));
        Self {
            timeouts,
            queues,
            entries: HashMap::new(),
        }
    }

    pub fn timeouts(&self) -> &NatTimeouts {
        &self.timeouts
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of sessions waiting in one queue.
    pub fn queue_len(&self, queue: QueueId) -> usize {
        self.queues.get(&queue).map_or(0, |q| q.len)
    }

    /// Create the two queues of a rule with its own timeouts. A zero
    /// reverse age falls back to the forward one.
    pub fn add_rule_queues(&mut self, rule: RuleKey, age: AgeOverride) {
        let forward = u64::from(age.forward_secs);
        let reverse = match age.reverse_secs {
            0 => forward,
            n => u64::from(n),
        };
        self.queues.insert(QueueId::Rule(rule, 0), Queue::new(forward));
        self.queues.insert(QueueId::Rule(rule, 1), Queue::new(reverse));
    }

    pub fn remove_rule_queues(&mut self, rule: RuleKey) {
        self.queues.remove(&QueueId::Rule(rule, 0));
        self.queues.remove(&QueueId::Rule(rule, 1));
    }

    /// Put a new session at the tail of `queue`.
    pub fn enqueue(&mut self, id: SessionId, queue: QueueId, now: u64) {
        self.remove(id);
        self.entries.insert(
            id,
            Entry {
                queue,
                die: 0,
                prev: None,
                next: None,
                tcp: [TcpState::Closed; 2],
            },
        );
        self.append(id, queue, now);
    }

    /// Move a session to the tail of `queue` with a fresh deadline.
    pub fn move_to(&mut self, id: SessionId, queue: QueueId, now: u64) {
        if !self.entries.contains_key(&id) {
            return;
        }
        self.detach(id);
        self.append(id, queue, now);
    }

    /// Refresh a session for one packet.
    pub fn update(&mut self, id: SessionId, update: AgeUpdate, now: u64) {
        match update {
            AgeUpdate::Rule(rule, rev) => self.move_to(id, QueueId::Rule(rule, rev), now),
            AgeUpdate::Class(queue) => self.move_to(id, queue, now),
            AgeUpdate::Tcp {
                rev,
                flags,
                data_len,
            } => {
                let Some(entry) = self.entries.get_mut(&id) else {
                    return;
                };
                if let TcpStep::Advance(next) = tcp_step(entry.tcp, rev, flags, data_len) {
                    entry.tcp[rev] = next;
                    self.move_to(id, QueueId::Tcp(next), now);
                }
            }
        }
    }

    pub fn remove(&mut self, id: SessionId) {
        if self.entries.contains_key(&id) {
            self.detach(id);
            self.entries.remove(&id);
        }
    }

    pub fn tcp_state(&self, id: SessionId) -> [TcpState; 2] {
        self.entries
            .get(&id)
            .map_or([TcpState::Closed; 2], |e| e.tcp)
    }

    pub fn set_tcp_state(&mut self, id: SessionId, tcp: [TcpState; 2]) {
        if let Some(e) = self.entries.get_mut(&id) {
            e.tcp = tcp;
        }
    }

    pub fn queue_of(&self, id: SessionId) -> Option<QueueId> {
        self.entries.get(&id).map(|e| e.queue)
    }

    /// Seconds until the session expires.
    pub fn expires_in(&self, id: SessionId, now: u64) -> u64 {
        self.entries
            .get(&id)
            .map_or(0, |e| e.die.saturating_sub(now))
    }

    /// Unlink and return every session whose deadline has passed.
    pub fn expired(&mut self, now: u64) -> Vec<SessionId> {
        let mut out = Vec::new();
        let heads: Vec<Option<SessionId>> = self.queues.values().map(|q| q.head).collect();
        for mut cursor in heads {
            while let Some(id) = cursor {
                let Some(entry) = self.entries.get(&id) else {
                    break;
                };
                if entry.die > now {
                    break;
                }
                cursor = entry.next;
                out.push(id);
            }
        }
        for id in &out {
            self.remove(*id);
        }
        out
    }

    /// Link `id` at the tail of `queue`. A queue that does not exist (a
    /// rule queue already torn down) falls back to the generic IP class so
    /// the session still ages out.
    fn append(&mut self, id: SessionId, queue: QueueId, now: u64) {
        let queue = if self.queues.contains_key(&queue) {
            queue
        } else {
            QueueId::Ip
        };
        let Some(q) = self.queues.get_mut(&queue) else {
            return;
        };
        let die = now.saturating_add(q.ttl);
        let prev = q.tail;
        q.tail = Some(id);
        if q.head.is_none() {
            q.head = Some(id);
        }
        q.len += 1;
        if let Some(p) = prev
            && let Some(pe) = self.entries.get_mut(&p)
        {
            pe.next = Some(id);
        }
        if let Some(e) = self.entries.get_mut(&id) {
            e.queue = queue;
            e.die = die;
            e.prev = prev;
            e.next = None;
        }
    }

    fn detach(&mut self, id: SessionId) {
        let Some(e) = self.entries.get(&id) else {
            return;
        };
        let (queue, prev, next) = (e.queue, e.prev, e.next);
        if let Some(p) = prev
            && let Some(pe) = self.entries.get_mut(&p)
        {
            pe.next = next;
        }
        if let Some(n) = next
            && let Some(ne) = self.entries.get_mut(&n)
        {
            ne.prev = prev;
        }
        if let Some(q) = self.queues.get_mut(&queue) {
            if q.head == Some(id) {
                q.head = next;
            }
            if q.tail == Some(id) {
                q.tail = prev;
            }
            q.len = q.len.saturating_sub(1);
        }
        if let Some(e) = self.entries.get_mut(&id) {
            e.prev = None;
            e.next = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(n: u64) -> SessionId {
        SessionId(n)
    }

    // ── TCP state machine ─────────────────────────────────────────

    #[test]
    fn three_way_handshake() {
        use TcpState::*;
        let mut st = [Closed; 2];
        let mut feed = |st: &mut [TcpState; 2], rev: usize, flags: u8| {
            if let TcpStep::Advance(n) = tcp_step(*st, rev, flags, 0) {
                st[rev] = n;
            }
        };
        feed(&mut st, 0, TCP_SYN);
        assert_eq!(st, [SynSent, Closed]);
        feed(&mut st, 1, TCP_SYN | TCP_ACK);
        assert_eq!(st, [SynSent, SynReceived]);
        feed(&mut st, 0, TCP_ACK);
        assert_eq!(st, [Established, SynReceived]);
        feed(&mut st, 1, TCP_ACK);
        assert_eq!(st, [Established, Established]);
    }

    #[test]
    fn orderly_close() {
        use TcpState::*;
        let mut st = [Established, Established];
        let mut feed = |st: &mut [TcpState; 2], rev: usize, flags: u8| {
            if let TcpStep::Advance(n) = tcp_step(*st, rev, flags, 0) {
                st[rev] = n;
            }
        };
        feed(&mut st, 0, TCP_FIN | TCP_ACK);
        assert_eq!(st[0], FinWait1);
        feed(&mut st, 1, TCP_ACK);
        assert_eq!(st[1], CloseWait);
        feed(&mut st, 1, TCP_FIN | TCP_ACK);
        assert_eq!(st[1], LastAck);
        feed(&mut st, 0, TCP_ACK);
        assert_eq!(st[0], TimeWait);
    }

    #[test]
    fn retransmitted_syn_holds_deadline() {
        let st = [TcpState::SynSent, TcpState::Closed];
        assert_eq!(tcp_step(st, 0, TCP_SYN, 0), TcpStep::Hold);
    }

    #[test]
    fn reset_closes() {
        let st = [TcpState::Established; 2];
        assert_eq!(
            tcp_step(st, 1, TCP_RST, 0),
            TcpStep::Advance(TcpState::Closed)
        );
        assert_eq!(
            tcp_step(st, 1, TCP_RST | TCP_PUSH, 0),
            TcpStep::Advance(TcpState::CloseWait)
        );
    }

    #[test]
    fn mid_flight_pickup() {
        let st = [TcpState::Closed; 2];
        assert_eq!(
            tcp_step(st, 0, TCP_ACK, 100),
            TcpStep::Advance(TcpState::HalfEstablished)
        );
        // A bare ACK answering a half-established peer completes the pickup.
        let st = [TcpState::HalfEstablished, TcpState::Closed];
        assert_eq!(
            tcp_step(st, 1, TCP_ACK, 0),
            TcpStep::Advance(TcpState::Established)
        );
        let st = [TcpState::HalfEstablished, TcpState::HalfEstablished];
        assert_eq!(
            tcp_step(st, 0, TCP_ACK, 0),
            TcpStep::Advance(TcpState::Established)
        );
    }

    #[test]
    fn state_round_trips_through_u8() {
        for s in TcpState::ALL {
            assert_eq!(TcpState::from_u8(s.as_u8()), Some(s));
        }
        assert_eq!(TcpState::from_u8(12), None);
    }

    // ── Timeouts ──────────────────────────────────────────────────

    #[test]
    fn tcp_ttls_floored_at_icmp() {
        let t = NatTimeouts {
            tcp_timeout: 1,
            icmp: 5,
            ..NatTimeouts::default()
        };
        assert_eq!(t.tcp(TcpState::SynSent), 5);
        assert_eq!(t.tcp(TcpState::Established), 432_000);
        assert_eq!(t.tcp(TcpState::Closed), 240);
    }

    // ── Queues ────────────────────────────────────────────────────

    #[test]
    fn expiry_stops_at_first_live_entry() {
        let mut q = AgingQueues::new(NatTimeouts::default());
        q.enqueue(sid(1), QueueId::Udp, 0);
        q.enqueue(sid(2), QueueId::Udp, 100);
        q.enqueue(sid(3), QueueId::Icmp, 650);

        assert!(q.expired(599).is_empty());
        assert_eq!(q.expired(600), vec![sid(1)]);
        assert_eq!(q.len(), 2);
        let mut rest = q.expired(700);
        rest.sort();
        assert_eq!(rest, vec![sid(2), sid(3)]);
        assert!(q.is_empty());
        assert_eq!(q.queue_len(QueueId::Udp), 0);
    }

    #[test]
    fn touch_moves_to_tail() {
        let mut q = AgingQueues::new(NatTimeouts::default());
        q.enqueue(sid(1), QueueId::Udp, 0);
        q.enqueue(sid(2), QueueId::Udp, 10);
        q.update(sid(1), AgeUpdate::Class(QueueId::Udp), 20);
        assert_eq!(q.expired(610), vec![sid(2)]);
        assert_eq!(q.expires_in(sid(1), 610), 10);
    }

    #[test]
    fn tcp_update_switches_queue() {
        let mut q = AgingQueues::new(NatTimeouts::default());
        q.enqueue(sid(1), QueueId::Tcp(TcpState::Closed), 0);
        q.update(
            sid(1),
            AgeUpdate::Tcp {
                rev: 0,
                flags: TCP_SYN,
                data_len: 0,
            },
            0,
        );
        assert_eq!(q.queue_of(sid(1)), Some(QueueId::Tcp(TcpState::SynSent)));
        assert_eq!(q.tcp_state(sid(1))[0], TcpState::SynSent);
        assert_eq!(q.queue_len(QueueId::Tcp(TcpState::Closed)), 0);
    }

    #[test]
    fn rule_queues_use_override() {
        let mut q = AgingQueues::new(NatTimeouts::default());
        let key = RuleKey(7);
        q.add_rule_queues(
            key,
            AgeOverride {
                forward_secs: 30,
                reverse_secs: 0,
            },
        );
        q.enqueue(sid(1), QueueId::Rule(key, 0), 0);
        q.update(sid(1), AgeUpdate::Rule(key, 1), 10);
        assert_eq!(q.expires_in(sid(1), 10), 30);
        assert_eq!(q.expired(40), vec![sid(1)]);
    }

    #[test]
    fn missing_rule_queue_falls_back_to_ip_class() {
        let mut q = AgingQueues::new(NatTimeouts::default());
        let gone = RuleKey(42);
        q.enqueue(sid(1), QueueId::Rule(gone, 0), 0);
        assert_eq!(q.queue_of(sid(1)), Some(QueueId::Ip));
        assert_eq!(q.queue_len(QueueId::Ip), 1);

        q.update(sid(1), AgeUpdate::Rule(gone, 1), 10);
        assert_eq!(q.queue_of(sid(1)), Some(QueueId::Ip));
        assert_eq!(q.expired(70), vec![sid(1)]);
        assert!(q.is_empty());
    }

    #[test]
    fn remove_unlinks_middle_entry() {
        let mut q = AgingQueues::new(NatTimeouts::default());
        for i in 1..=3 {
            q.enqueue(sid(i), QueueId::Ip, 0);
        }
        q.remove(sid(2));
        assert_eq!(q.queue_len(QueueId::Ip), 2);
        assert_eq!(q.expired(60), vec![sid(1), sid(3)]);
    }
}
