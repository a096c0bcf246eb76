//! Interfaces to external workload datasets.

pub mod planetlab_reader;
pub mod swf_reader;
pub mod workload;
