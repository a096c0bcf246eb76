//! Reader of PlanetLab CPU utilization traces.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::core::utilization_model::UtilizationModelTrace;

/// Sampling interval of the PlanetLab traces in seconds.
const SAMPLE_INTERVAL: f64 = 300.;

/// Reads a single PlanetLab trace file into a utilization model.
///
/// A trace file holds the CPU utilization of one VM sampled every 300 seconds
/// for 24 hours: 288 integers in 0..=100, one per line. The file name is the
/// VM identifier.
pub fn read_planetlab_trace(path: &str) -> Result<UtilizationModelTrace, std::io::Error> {
    let file = fs::File::open(path)?;
    let mut samples = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value = line.parse::<f64>().map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad utilization value {:?} in {}: {}", line, path, err),
            )
        })?;
        samples.push(value / 100.);
    }
    if samples.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("trace {} holds no samples", path),
        ));
    }
    Ok(UtilizationModelTrace::new(samples, SAMPLE_INTERVAL))
}

/// Reads a directory of PlanetLab traces, one file per VM.
///
/// Returns (VM name, utilization model) pairs ordered by file name, so the
/// traversal order is stable across runs.
pub fn read_planetlab_directory(dir: &str) -> Result<Vec<(String, UtilizationModelTrace)>, std::io::Error> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    let mut traces = Vec::with_capacity(names.len());
    for name in names {
        let path = Path::new(dir).join(&name);
        let model = read_planetlab_trace(path.to_str().unwrap())?;
        traces.push((name, model));
    }
    Ok(traces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::utilization_model::UtilizationModel;
    use std::io::Write;

    #[test]
    fn test_read_trace() {
        let dir = std::env::temp_dir().join("dcsim-planetlab-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("vm_at_planetlab_node");
        let mut file = fs::File::create(&path).unwrap();
        for value in [0, 50, 100] {
            writeln!(file, "{}", value).unwrap();
        }
        let model = read_planetlab_trace(path.to_str().unwrap()).unwrap();
        assert_eq!(model.utilization(0.), 0.);
        assert_eq!(model.utilization(300.), 0.5);
        assert_eq!(model.utilization(600.), 1.);
        // interpolation between samples
        assert_eq!(model.utilization(150.), 0.25);
    }

    #[test]
    fn test_empty_trace_is_an_error() {
        let dir = std::env::temp_dir().join("dcsim-planetlab-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("empty_trace");
        fs::File::create(&path).unwrap();
        assert!(read_planetlab_trace(path.to_str().unwrap()).is_err());
    }
}
