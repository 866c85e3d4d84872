//! Scheduling summaries for offline schedulers.
//!
//! Each thread contributes a sample per timestamp or CPU marker; after the
//! workers join, the samples are merged into one serial, timestamp-ordered
//! schedule and one schedule per CPU.

use std::io::{self, Write};

/// Fixed 32-byte little-endian sample:
/// `| tid: u64 | cpu: u64 | timestamp: u64 | instr_ordinal: u64 |`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SchedSample {
    pub tid: u64,
    pub cpu: u64,
    pub timestamp: u64,
    pub instr_ordinal: u64,
}

pub const SCHED_SAMPLE_SIZE: usize = 32;

impl SchedSample {
    pub fn emit(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.tid.to_le_bytes());
        buffer.extend_from_slice(&self.cpu.to_le_bytes());
        buffer.extend_from_slice(&self.timestamp.to_le_bytes());
        buffer.extend_from_slice(&self.instr_ordinal.to_le_bytes());
    }

    pub fn parse(bytes: [u8; SCHED_SAMPLE_SIZE]) -> Self {
        let word = |i: usize| u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
        Self {
            tid: word(0),
            cpu: word(1),
            timestamp: word(2),
            instr_ordinal: word(3),
        }
    }
}

/// Collects every thread's samples and writes the aggregate schedules.
#[derive(Debug, Default)]
pub struct ScheduleAggregator {
    samples: Vec<SchedSample>,
}

impl ScheduleAggregator {
    pub fn extend(&mut self, samples: Vec<SchedSample>) {
        self.samples.extend(samples);
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// All samples ordered by timestamp, ties broken by tid.
    pub fn serial(&self) -> Vec<SchedSample> {
        let mut sorted = self.samples.clone();
        sorted.sort_by_key(|s| (s.timestamp, s.tid));
        sorted
    }

    /// The CPUs any sample ran on, ascending.
    pub fn cpus(&self) -> Vec<u64> {
        let mut cpus: Vec<u64> = self.samples.iter().map(|s| s.cpu).collect();
        cpus.sort_unstable();
        cpus.dedup();
        cpus
    }

    pub fn for_cpu(&self, cpu: u64) -> Vec<SchedSample> {
        let mut sorted: Vec<SchedSample> =
            self.samples.iter().filter(|s| s.cpu == cpu).copied().collect();
        sorted.sort_by_key(|s| (s.timestamp, s.tid));
        sorted
    }

    pub fn write_serial(&self, out: &mut dyn Write) -> io::Result<()> {
        Self::write_samples(&self.serial(), out)
    }

    pub fn write_cpu(&self, cpu: u64, out: &mut dyn Write) -> io::Result<()> {
        Self::write_samples(&self.for_cpu(cpu), out)
    }

    fn write_samples(samples: &[SchedSample], out: &mut dyn Write) -> io::Result<()> {
        let mut buffer = Vec::with_capacity(samples.len() * SCHED_SAMPLE_SIZE);
        for sample in samples {
            sample.emit(&mut buffer);
        }
        out.write_all(&buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(tid: u64, cpu: u64, timestamp: u64, instr_ordinal: u64) -> SchedSample {
        SchedSample {
            tid,
            cpu,
            timestamp,
            instr_ordinal,
        }
    }

    #[test]
    fn serial_schedule_is_timestamp_ordered() {
        let mut agg = ScheduleAggregator::default();
        agg.extend(vec![sample(1, 0, 30, 5), sample(1, 0, 10, 0)]);
        agg.extend(vec![sample(2, 1, 20, 0)]);
        let serial = agg.serial();
        assert_eq!(
            serial.iter().map(|s| s.timestamp).collect::<Vec<_>>(),
            vec![10, 20, 30]
        );
    }

    #[test]
    fn per_cpu_schedules_partition_samples() {
        let mut agg = ScheduleAggregator::default();
        agg.extend(vec![sample(1, 0, 10, 0), sample(2, 1, 20, 0), sample(1, 0, 30, 9)]);
        assert_eq!(agg.cpus(), vec![0, 1]);
        assert_eq!(agg.for_cpu(0).len(), 2);
        assert_eq!(agg.for_cpu(1).len(), 1);
    }

    #[test]
    fn samples_roundtrip() {
        let original = sample(7, 3, 0x1_0000, 99);
        let mut buffer = Vec::new();
        original.emit(&mut buffer);
        assert_eq!(buffer.len(), SCHED_SAMPLE_SIZE);
        assert_eq!(SchedSample::parse(buffer.try_into().unwrap()), original);
    }
}
