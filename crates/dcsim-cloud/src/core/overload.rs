//! Host overload detection.

use strum_macros::EnumString;

use crate::core::host::Host;

/// Decides whether a host is overloaded.
///
/// Implementations are pure functions of the host utilization history and its
/// current utilization, so repeated evaluations within one optimization pass
/// agree with each other.
pub trait OverloadDetector {
    fn is_host_overloaded(&self, host: &Host) -> bool;

    /// The detector-specific metric recorded by the allocation policy next to
    /// the utilization history (e.g. the effective utilization threshold).
    fn metric(&self, host: &Host) -> f64;
}

#[derive(Clone, Debug, PartialEq, EnumString)]
pub enum OverloadDetectorType {
    StaticThreshold,
    MedianAbsoluteDeviation,
    InterQuartileRange,
    LocalRegression,
}

/// Parses an overload detector from a config string,
/// e.g. `StaticThreshold[threshold=0.8]` or `LocalRegression[safety=1.2,interval=300]`.
pub fn parse_overload_detector(raw: &str) -> Box<dyn OverloadDetector> {
    let cleanup = raw.replace(']', "").replace('"', "");
    let split = cleanup.split('[').collect::<Vec<&str>>();
    let detector_type: OverloadDetectorType = split
        .first()
        .unwrap()
        .parse()
        .unwrap_or_else(|_| panic!("Can't resolve overload detector: {}", raw));
    let mut options = std::collections::HashMap::new();
    for variable in split.get(1).copied().unwrap_or_default().split(',') {
        let split = variable.split('=').collect::<Vec<&str>>();
        if split.len() == 2 {
            options.insert(split[0].to_string(), split[1].parse::<f64>().unwrap());
        }
    }

    match detector_type {
        OverloadDetectorType::StaticThreshold => {
            Box::new(StaticThreshold::new(options.get("threshold").copied().unwrap_or(0.8)))
        }
        OverloadDetectorType::MedianAbsoluteDeviation => Box::new(MedianAbsoluteDeviation::new(
            options.get("safety").copied().unwrap_or(2.5),
        )),
        OverloadDetectorType::InterQuartileRange => {
            Box::new(InterQuartileRange::new(options.get("safety").copied().unwrap_or(1.5)))
        }
        OverloadDetectorType::LocalRegression => Box::new(LocalRegression::new(
            options.get("safety").copied().unwrap_or(1.2),
            options.get("interval").copied().unwrap_or(300.),
        )),
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Overload above a fixed utilization threshold.
pub struct StaticThreshold {
    threshold: f64,
}

impl StaticThreshold {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl OverloadDetector for StaticThreshold {
    fn is_host_overloaded(&self, host: &Host) -> bool {
        host.utilization_of_cpu() > self.threshold
    }

    fn metric(&self, _host: &Host) -> f64 {
        self.threshold
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Number of utilization history entries required by the adaptive detectors.
const MIN_HISTORY_LENGTH: usize = 12;

/// Adaptive threshold based on the median absolute deviation of the host
/// utilization history: `threshold = 1 - safety * MAD`.
///
/// Falls back to a static threshold while the history is short.
pub struct MedianAbsoluteDeviation {
    safety_parameter: f64,
    fallback: StaticThreshold,
}

impl MedianAbsoluteDeviation {
    pub fn new(safety_parameter: f64) -> Self {
        Self {
            safety_parameter,
            fallback: StaticThreshold::new(0.8),
        }
    }

    fn threshold(&self, host: &Host) -> Option<f64> {
        let history: Vec<f64> = host.utilization_history().iter().cloned().collect();
        if history.len() < MIN_HISTORY_LENGTH {
            return None;
        }
        Some(1. - self.safety_parameter * mad(&history))
    }
}

impl OverloadDetector for MedianAbsoluteDeviation {
    fn is_host_overloaded(&self, host: &Host) -> bool {
        match self.threshold(host) {
            Some(threshold) => host.utilization_of_cpu() >= threshold,
            None => self.fallback.is_host_overloaded(host),
        }
    }

    fn metric(&self, host: &Host) -> f64 {
        self.threshold(host).unwrap_or_else(|| self.fallback.metric(host))
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Adaptive threshold based on the interquartile range of the host utilization
/// history: `threshold = 1 - safety * IQR`.
pub struct InterQuartileRange {
    safety_parameter: f64,
    fallback: StaticThreshold,
}

impl InterQuartileRange {
    pub fn new(safety_parameter: f64) -> Self {
        Self {
            safety_parameter,
            fallback: StaticThreshold::new(0.8),
        }
    }

    fn threshold(&self, host: &Host) -> Option<f64> {
        let history: Vec<f64> = host.utilization_history().iter().cloned().collect();
        if history.len() < MIN_HISTORY_LENGTH {
            return None;
        }
        Some(1. - self.safety_parameter * iqr(&history))
    }
}

impl OverloadDetector for InterQuartileRange {
    fn is_host_overloaded(&self, host: &Host) -> bool {
        match self.threshold(host) {
            Some(threshold) => host.utilization_of_cpu() >= threshold,
            None => self.fallback.is_host_overloaded(host),
        }
    }

    fn metric(&self, host: &Host) -> f64 {
        self.threshold(host).unwrap_or_else(|| self.fallback.metric(host))
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Predicts the utilization at the next scheduling interval with a local
/// (tricube-weighted) linear regression over the utilization history and
/// reports overload when the safety-scaled prediction reaches full capacity.
pub struct LocalRegression {
    safety_parameter: f64,
    scheduling_interval: f64,
    fallback: StaticThreshold,
}

/// Number of history entries used to fit the local regression.
const REGRESSION_WINDOW: usize = 10;

impl LocalRegression {
    pub fn new(safety_parameter: f64, scheduling_interval: f64) -> Self {
        Self {
            safety_parameter,
            scheduling_interval,
            fallback: StaticThreshold::new(0.8),
        }
    }

    fn predicted_utilization(&self, host: &Host) -> Option<f64> {
        let history: Vec<f64> = host.utilization_history().iter().cloned().collect();
        if history.len() < REGRESSION_WINDOW {
            return None;
        }
        // history is stored most recent first, the regression wants it in time order
        let window: Vec<f64> = history[..REGRESSION_WINDOW].iter().rev().cloned().collect();
        let (intercept, slope) = loess_parameter_estimates(&window);
        let migration_intervals = (self.scheduling_interval / 300.).ceil().max(1.);
        Some(intercept + slope * (window.len() as f64 + migration_intervals))
    }
}

impl OverloadDetector for LocalRegression {
    fn is_host_overloaded(&self, host: &Host) -> bool {
        match self.predicted_utilization(host) {
            Some(predicted) => predicted * self.safety_parameter >= 1.,
            None => self.fallback.is_host_overloaded(host),
        }
    }

    fn metric(&self, host: &Host) -> f64 {
        self.predicted_utilization(host)
            .unwrap_or_else(|| self.fallback.metric(host))
    }
}

////////////////////////////////////////////////////////////////////////////////

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.
    }
}

/// Median absolute deviation of the data.
fn mad(data: &[f64]) -> f64 {
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let med = median(&sorted);
    let mut deviations: Vec<f64> = data.iter().map(|x| (x - med).abs()).collect();
    deviations.sort_by(|a, b| a.total_cmp(b));
    median(&deviations)
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let idx = pos.floor() as usize;
    if idx + 1 >= sorted.len() {
        return sorted[sorted.len() - 1];
    }
    let fraction = pos - idx as f64;
    sorted[idx] + (sorted[idx + 1] - sorted[idx]) * fraction
}

/// Interquartile range of the data.
fn iqr(data: &[f64]) -> f64 {
    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    quantile(&sorted, 0.75) - quantile(&sorted, 0.25)
}

/// Intercept and slope of a tricube-weighted least squares fit of the data
/// against the time steps `1..=n`, emphasizing the most recent observations.
fn loess_parameter_estimates(data: &[f64]) -> (f64, f64) {
    let n = data.len();
    let weights: Vec<f64> = (0..n)
        .map(|i| {
            let distance = (n - 1 - i) as f64 / n as f64;
            (1. - distance.powi(3)).powi(3)
        })
        .collect();

    let weight_sum: f64 = weights.iter().sum();
    let mean_x = (0..n).map(|i| weights[i] * (i + 1) as f64).sum::<f64>() / weight_sum;
    let mean_y = (0..n).map(|i| weights[i] * data[i]).sum::<f64>() / weight_sum;
    let mut covariance = 0.;
    let mut variance = 0.;
    for i in 0..n {
        let x = (i + 1) as f64;
        covariance += weights[i] * (x - mean_x) * (data[i] - mean_y);
        variance += weights[i] * (x - mean_x).powi(2);
    }
    if variance == 0. {
        return (mean_y, 0.);
    }
    let slope = covariance / variance;
    (mean_y - slope * mean_x, slope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mad() {
        let data = [1., 1., 2., 2., 4., 6., 9.];
        assert_eq!(mad(&data), 1.);
    }

    #[test]
    fn test_iqr() {
        let data = [1., 2., 3., 4., 5.];
        assert_eq!(iqr(&data), 2.);
    }

    #[test]
    fn test_loess_estimates_follow_a_line() {
        // y = 0.1 + 0.05 x must be recovered exactly by a weighted linear fit
        let data: Vec<f64> = (1..=10).map(|x| 0.1 + 0.05 * x as f64).collect();
        let (intercept, slope) = loess_parameter_estimates(&data);
        assert!((intercept - 0.1).abs() < 1e-9);
        assert!((slope - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_parse_overload_detector() {
        parse_overload_detector("StaticThreshold[threshold=0.7]");
        parse_overload_detector("MedianAbsoluteDeviation[safety=2.5]");
        parse_overload_detector("InterQuartileRange");
        parse_overload_detector("LocalRegression[safety=1.2,interval=300]");
    }

    #[test]
    #[should_panic(expected = "Can't resolve overload detector")]
    fn test_parse_unknown_detector() {
        parse_overload_detector("Quantum[qubits=3]");
    }
}
