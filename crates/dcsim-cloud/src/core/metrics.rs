//! Per-experiment metrics and their CSV export.

use std::fs::File;

use serde::Serialize;

/// Summary metrics of a single simulation run.
#[derive(Clone, Debug, Serialize)]
pub struct ExperimentMetrics {
    pub experiment_name: String,
    pub simulation_time: f64,
    pub energy_consumption: f64,
    pub migration_count: u32,
    pub sla_violation: f64,
    pub mean_optimization_time: f64,
}

/// Appends the metrics of the given runs to a CSV file.
pub fn save_metrics(path: &str, metrics: &[ExperimentMetrics]) -> Result<(), std::io::Error> {
    let file = File::create(path)?;
    let mut wtr = csv::Writer::from_writer(file);
    for entry in metrics {
        wtr.serialize(entry)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Arithmetic mean, 0 for an empty sample.
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), 0.);
        assert_eq!(mean(&[2., 4.]), 3.);
    }

    #[test]
    fn test_save_metrics() {
        let dir = std::env::temp_dir().join("dcsim-metrics-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("metrics.csv");
        let metrics = vec![ExperimentMetrics {
            experiment_name: "smoke".to_string(),
            simulation_time: 10.,
            energy_consumption: 100.,
            migration_count: 2,
            sla_violation: 0.1,
            mean_optimization_time: 0.001,
        }];
        save_metrics(path.to_str().unwrap(), &metrics).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("experiment_name,simulation_time,energy_consumption"));
        assert!(contents.contains("smoke,10.0,100.0,2,0.1,0.001"));
    }
}
