//! Bounded, age-expiring outbound queue

use std::collections::VecDeque;
use std::time::Duration;
use tether_session::Packet;
use tracing::debug;

#[derive(Debug)]
pub struct OutboundQueue {
    packets: VecDeque<Packet>,
    capacity: usize,
    max_age: Duration,
}

impl OutboundQueue {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            packets: VecDeque::new(),
            capacity,
            max_age,
        }
    }

    pub fn push_back(&mut self, packet: Packet) {
        self.packets.push_back(packet);
    }

    /// Put packets back at the head, keeping their relative order
    pub fn push_front_all(&mut self, packets: Vec<Packet>) {
        for packet in packets.into_iter().rev() {
            self.packets.push_front(packet);
        }
    }

    pub fn pop_front(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }

    /// Drop packets past their age, then the oldest beyond capacity
    ///
    /// Returns how many were dropped.
    pub fn expire(&mut self) -> usize {
        let before = self.packets.len();
        let max_age = self.max_age;
        self.packets.retain(|packet| !packet.is_expired(max_age));
        let aged = before - self.packets.len();

        let mut trimmed = 0;
        while self.packets.len() > self.capacity {
            self.packets.pop_front();
            trimmed += 1;
        }

        if aged + trimmed > 0 {
            debug!(aged, trimmed, remaining = self.packets.len(), "Expired packets");
        }
        aged + trimmed
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.packets.len();
        self.packets.clear();
        dropped
    }
}
