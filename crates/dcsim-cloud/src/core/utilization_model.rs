//! Cloudlet CPU utilization models.

use std::cell::RefCell;
use std::collections::HashMap;

use dyn_clone::{clone_trait_object, DynClone};
use rand::prelude::*;
use rand_pcg::Pcg64;
use strum_macros::EnumString;

/// A utilization model is a function of simulation time returning the CPU
/// demand of a cloudlet as a fraction of its full speed in [0, 1].
pub trait UtilizationModel: DynClone {
    fn utilization(&self, time: f64) -> f64;
}

clone_trait_object!(UtilizationModel);

#[derive(Clone, Debug, PartialEq, EnumString)]
pub enum UtilizationModelType {
    Full,
    Constant,
    Stochastic,
}

/// Parses a utilization model from a config string, e.g. `Constant[utilization=0.5]`.
pub fn parse_utilization_model(raw: &str) -> Box<dyn UtilizationModel> {
    let cleanup = raw.replace(']', "").replace('"', "");
    let split = cleanup.split('[').collect::<Vec<&str>>();
    let model_type: UtilizationModelType = split
        .first()
        .unwrap()
        .parse()
        .unwrap_or_else(|_| panic!("Can't resolve utilization model: {}", raw));
    let model_args = split.get(1).copied().unwrap_or_default();

    match model_type {
        UtilizationModelType::Full => Box::new(UtilizationModelFull::new()),
        UtilizationModelType::Constant => {
            let mut utilization = 1.;
            for variable in model_args.split(',') {
                let split = variable.split('=').collect::<Vec<&str>>();
                if *split.first().unwrap() == "utilization" {
                    utilization = split.get(1).unwrap().parse::<f64>().unwrap();
                }
            }
            Box::new(UtilizationModelConstant::new(utilization))
        }
        UtilizationModelType::Stochastic => {
            let mut seed = 1;
            for variable in model_args.split(',') {
                let split = variable.split('=').collect::<Vec<&str>>();
                if *split.first().unwrap() == "seed" {
                    seed = split.get(1).unwrap().parse::<u64>().unwrap();
                }
            }
            Box::new(UtilizationModelStochastic::new(seed))
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Always demands the full cloudlet speed.
#[derive(Clone, Default)]
pub struct UtilizationModelFull {}

impl UtilizationModelFull {
    pub fn new() -> Self {
        Default::default()
    }
}

impl UtilizationModel for UtilizationModelFull {
    fn utilization(&self, _time: f64) -> f64 {
        1.
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Demands a constant fraction of the cloudlet speed.
#[derive(Clone)]
pub struct UtilizationModelConstant {
    utilization: f64,
}

impl UtilizationModelConstant {
    pub fn new(utilization: f64) -> Self {
        assert!((0. ..=1.).contains(&utilization));
        Self { utilization }
    }
}

impl UtilizationModel for UtilizationModelConstant {
    fn utilization(&self, _time: f64) -> f64 {
        self.utilization
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Demands a random fraction of the cloudlet speed.
///
/// The utilization values are drawn from a seeded generator and memoized per
/// query time, so repeated queries at the same time and reruns with the same
/// seed observe identical values.
#[derive(Clone)]
pub struct UtilizationModelStochastic {
    rand: RefCell<Pcg64>,
    history: RefCell<HashMap<u64, f64>>,
}

impl UtilizationModelStochastic {
    pub fn new(seed: u64) -> Self {
        Self {
            rand: RefCell::new(Pcg64::seed_from_u64(seed)),
            history: RefCell::new(HashMap::new()),
        }
    }
}

impl UtilizationModel for UtilizationModelStochastic {
    fn utilization(&self, time: f64) -> f64 {
        let key = time.to_bits();
        if let Some(&utilization) = self.history.borrow().get(&key) {
            return utilization;
        }
        let utilization = self.rand.borrow_mut().gen_range(0.0..1.0);
        self.history.borrow_mut().insert(key, utilization);
        utilization
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Replays a CPU utilization trace sampled at a fixed interval, with linear
/// interpolation between samples. Queries beyond the trace end wrap around.
#[derive(Clone)]
pub struct UtilizationModelTrace {
    samples: Vec<f64>,
    sample_interval: f64,
}

impl UtilizationModelTrace {
    pub fn new(samples: Vec<f64>, sample_interval: f64) -> Self {
        assert!(!samples.is_empty());
        assert!(sample_interval > 0.);
        Self {
            samples,
            sample_interval,
        }
    }
}

impl UtilizationModel for UtilizationModelTrace {
    fn utilization(&self, time: f64) -> f64 {
        let span = self.sample_interval * self.samples.len() as f64;
        let time = time.rem_euclid(span);
        let pos = time / self.sample_interval;
        let idx = pos.floor() as usize;
        let next = (idx + 1) % self.samples.len();
        let fraction = pos - idx as f64;
        self.samples[idx] + (self.samples[next] - self.samples[idx]) * fraction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_model_parse() {
        let model = parse_utilization_model("Constant[utilization=0.5]");
        assert_eq!(model.utilization(0.), 0.5);
        assert_eq!(model.utilization(100.), 0.5);
    }

    #[test]
    fn test_stochastic_model_is_deterministic() {
        let model1 = UtilizationModelStochastic::new(42);
        let model2 = UtilizationModelStochastic::new(42);
        for step in 0..10 {
            let time = step as f64 * 300.;
            assert_eq!(model1.utilization(time), model2.utilization(time));
        }
        // memoized per query time
        assert_eq!(model1.utilization(0.), model1.utilization(0.));
    }

    #[test]
    fn test_trace_model_interpolates() {
        let model = UtilizationModelTrace::new(vec![0., 1., 0.5], 300.);
        assert_eq!(model.utilization(0.), 0.);
        assert_eq!(model.utilization(300.), 1.);
        assert_eq!(model.utilization(150.), 0.5);
        assert_eq!(model.utilization(450.), 0.75);
        // wraps around at the trace end
        assert_eq!(model.utilization(900.), 0.);
    }
}
