//! Reader of workload files in the Standard Workload Format (SWF).

use std::fs::File;
use std::io::{BufRead, BufReader, Read};

use flate2::read::GzDecoder;

use crate::extensions::workload::{WorkloadEntry, WorkloadSource};

// 1-based SWF columns used by the simulator
const SUBMIT_TIME_COLUMN: usize = 2;
const RUN_TIME_COLUMN: usize = 4;
const PROCESSORS_COLUMN: usize = 5;

/// Reads jobs from an SWF file, optionally gzipped.
///
/// The file is ASCII with 18 whitespace-separated columns per line, lines
/// starting with `;` are comments. Jobs with a non-positive run time or
/// processor count are discarded, as are lines that fail to parse. The job
/// run time is converted into a work length by the `rating` parameter
/// (MIPS per processor).
pub struct SwfWorkloadReader {
    entries: Vec<WorkloadEntry>,
    position: usize,
}

impl SwfWorkloadReader {
    pub fn new(path: &str, rating: f64, ram_per_job: u64, bw_per_job: u64) -> Result<Self, std::io::Error> {
        let file = File::open(path)?;
        let reader: Box<dyn Read> = if path.ends_with(".gz") {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };

        let mut entries = Vec::new();
        for line in BufReader::new(reader).lines() {
            let line = line?;
            if let Some(entry) = Self::parse_line(&line, rating, ram_per_job, bw_per_job) {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.arrival_time.total_cmp(&b.arrival_time));
        Ok(Self { entries, position: 0 })
    }

    fn parse_line(line: &str, rating: f64, ram: u64, bw: u64) -> Option<WorkloadEntry> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            return None;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < PROCESSORS_COLUMN {
            return None;
        }
        let submit_time = fields[SUBMIT_TIME_COLUMN - 1].parse::<f64>().ok()?;
        let run_time = fields[RUN_TIME_COLUMN - 1].parse::<f64>().ok()?;
        let processors = fields[PROCESSORS_COLUMN - 1].parse::<i64>().ok()?;
        if run_time <= 0. || processors <= 0 {
            return None;
        }
        Some(WorkloadEntry {
            arrival_time: submit_time.max(0.),
            length: run_time * rating,
            pes: processors as u32,
            ram,
            bw,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl WorkloadSource for SwfWorkloadReader {
    fn next_entry(&mut self) -> Option<WorkloadEntry> {
        let entry = self.entries.get(self.position).cloned();
        if entry.is_some() {
            self.position += 1;
        }
        entry
    }
}
