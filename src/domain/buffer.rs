//! Reading Buffer
//!
//! Bounded, timestamp-ordered history of vitals readings. Live telemetry and
//! flash-log backfill both write through [`ReadingBuffer::append`] /
//! [`ReadingBuffer::merge`], which enforce ordering, deduplication and FIFO
//! eviction.

use crate::domain::models::VitalsReading;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Seven days of readings at one reading every five seconds
pub const DEFAULT_MAX_READINGS: usize = 7 * 24 * 60 * 60 / 5;

pub const MS_PER_DAY: i64 = 86_400_000;

/// Buffer shared between the two producers
pub type SharedReadings = Arc<Mutex<ReadingBuffer>>;

#[derive(Debug, Clone)]
pub struct ReadingBuffer {
    readings: VecDeque<VitalsReading>,
    capacity: usize,
}

impl Default for ReadingBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_READINGS)
    }
}

impl ReadingBuffer {
    /// A capacity of zero is raised to one
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            readings: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn shared(capacity: usize) -> SharedReadings {
        Arc::new(Mutex::new(Self::with_capacity(capacity)))
    }

    /// Insert one reading in timestamp order.
    ///
    /// Returns false if a reading with the same timestamp is already present.
    pub fn append(&mut self, reading: VitalsReading) -> bool {
        let inserted = self.insert_ordered(reading);
        self.evict_overflow();
        inserted
    }

    /// Insert a batch of readings, returning how many of them the buffer
    /// still holds once overflow has been evicted
    pub fn merge<I>(&mut self, readings: I) -> usize
    where
        I: IntoIterator<Item = VitalsReading>,
    {
        let inserted: Vec<i64> = readings
            .into_iter()
            .filter(|r| self.insert_ordered(*r))
            .map(|r| r.timestamp)
            .collect();
        self.evict_overflow();

        // Eviction only drops from the front, so survivors are the ones at or
        // after the oldest retained timestamp
        let Some(oldest) = self.readings.front().map(|r| r.timestamp) else {
            return 0;
        };
        inserted.into_iter().filter(|ts| *ts >= oldest).count()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent reading
    pub fn last(&self) -> Option<VitalsReading> {
        self.readings.back().copied()
    }

    /// Owned copy of every reading, oldest first
    pub fn snapshot(&self) -> Vec<VitalsReading> {
        self.readings.iter().copied().collect()
    }

    /// Readings with `timestamp >= cutoff_ms`, oldest first
    pub fn window_since(&self, cutoff_ms: i64) -> Vec<VitalsReading> {
        let start = self.readings.partition_point(|r| r.timestamp < cutoff_ms);
        self.readings.range(start..).copied().collect()
    }

    /// Readings from the last `days` days relative to `now_ms`
    pub fn window(&self, days: u32, now_ms: i64) -> Vec<VitalsReading> {
        self.window_since(now_ms - i64::from(days) * MS_PER_DAY)
    }

    fn insert_ordered(&mut self, reading: VitalsReading) -> bool {
        // Live telemetry arrives in order
        match self.readings.back() {
            None => {
                self.readings.push_back(reading);
                return true;
            }
            Some(last) if last.timestamp < reading.timestamp => {
                self.readings.push_back(reading);
                return true;
            }
            _ => {}
        }

        let pos = self
            .readings
            .partition_point(|r| r.timestamp < reading.timestamp);
        if self
            .readings
            .get(pos)
            .is_some_and(|r| r.timestamp == reading.timestamp)
        {
            return false;
        }
        self.readings.insert(pos, reading);
        true
    }

    fn evict_overflow(&mut self) {
        while self.readings.len() > self.capacity {
            self.readings.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(timestamp: i64) -> VitalsReading {
        VitalsReading {
            heart_rate: 60,
            spo2: 97,
            temperature: 365,
            battery: 90,
            motion_level: 0,
            readiness_score: 80,
            fever_flag: false,
            timestamp,
        }
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let mut buffer = ReadingBuffer::with_capacity(5);
        for ts in 0..50 {
            buffer.append(reading(ts));
            assert!(buffer.len() <= 5);
        }
        let timestamps: Vec<i64> = buffer.snapshot().iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![45, 46, 47, 48, 49]);
    }

    #[test]
    fn test_oldest_evicted_first() {
        let mut buffer = ReadingBuffer::with_capacity(3);
        buffer.append(reading(20));
        buffer.append(reading(10));
        buffer.append(reading(30));
        buffer.append(reading(40));

        let timestamps: Vec<i64> = buffer.snapshot().iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![20, 30, 40]);
    }

    #[test]
    fn test_out_of_order_insert_and_dedup() {
        let mut buffer = ReadingBuffer::with_capacity(10);
        assert!(buffer.append(reading(100)));
        assert!(buffer.append(reading(300)));
        assert!(buffer.append(reading(200)));
        assert!(!buffer.append(reading(200)));

        let timestamps: Vec<i64> = buffer.snapshot().iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![100, 200, 300]);
        assert_eq!(buffer.last().map(|r| r.timestamp), Some(300));
    }

    #[test]
    fn test_merge_counts_accepted() {
        let mut buffer = ReadingBuffer::with_capacity(10);
        buffer.append(reading(5));
        let accepted = buffer.merge(vec![reading(1), reading(5), reading(3), reading(3)]);
        assert_eq!(accepted, 2);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_merge_into_full_buffer_counts_only_kept() {
        let mut buffer = ReadingBuffer::with_capacity(3);
        buffer.merge(vec![reading(10), reading(20), reading(30)]);

        // Older than everything stored: inserted, then evicted straight away
        assert_eq!(buffer.merge(vec![reading(1), reading(2)]), 0);
        let timestamps: Vec<i64> = buffer.snapshot().iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![10, 20, 30]);

        assert_eq!(buffer.merge(vec![reading(5), reading(25), reading(40)]), 2);
        let timestamps: Vec<i64> = buffer.snapshot().iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![25, 30, 40]);
    }

    #[test]
    fn test_window() {
        let mut buffer = ReadingBuffer::with_capacity(10);
        let now = 10 * MS_PER_DAY;
        buffer.merge(vec![
            reading(now - 3 * MS_PER_DAY),
            reading(now - MS_PER_DAY),
            reading(now - 1000),
        ]);

        assert_eq!(buffer.window(1, now).len(), 2);
        assert_eq!(buffer.window(7, now).len(), 3);
        assert_eq!(buffer.window(0, now).len(), 0);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut buffer = ReadingBuffer::with_capacity(0);
        buffer.append(reading(1));
        buffer.append(reading(2));
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.snapshot(), vec![reading(2)]);
    }
}
