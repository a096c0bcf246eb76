//! Host power consumption models.

use dyn_clone::{clone_trait_object, DynClone};

/// Power model of a physical host.
pub trait HostPowerModel: DynClone {
    /// Returns the host power consumption in watts at the given CPU utilization in [0, 1].
    fn power(&self, utilization: f64) -> f64;

    /// Returns the host power consumption at full load.
    fn max_power(&self) -> f64;
}

clone_trait_object!(HostPowerModel);

/// A power model based on linear interpolation between the minimum and maximum power consumption values.
#[derive(Clone)]
pub struct LinearPowerModel {
    max_power: f64,
    min_power: f64,
    factor: f64,
}

impl LinearPowerModel {
    /// Creates linear power model with specified parameters.
    ///
    /// * `max_power` - the power consumption at 100% utilization.
    /// * `min_power` - the power consumption of an idle host.
    pub fn new(max_power: f64, min_power: f64) -> Self {
        Self {
            min_power,
            max_power,
            factor: max_power - min_power,
        }
    }
}

impl HostPowerModel for LinearPowerModel {
    fn power(&self, utilization: f64) -> f64 {
        self.min_power + self.factor * utilization
    }

    fn max_power(&self) -> f64 {
        self.max_power
    }
}

/// A power model with constant power consumption value.
#[derive(Clone)]
pub struct ConstantPowerModel {
    power: f64,
}

impl ConstantPowerModel {
    pub fn new(power: f64) -> Self {
        Self { power }
    }
}

impl HostPowerModel for ConstantPowerModel {
    fn power(&self, _utilization: f64) -> f64 {
        self.power
    }

    fn max_power(&self) -> f64 {
        self.power
    }
}

/// A piecewise-linear power model built from measured power values at
/// utilization levels 0%, 10%, ..., 100%.
#[derive(Clone)]
pub struct EmpiricalPowerModel {
    points: Vec<f64>,
}

impl EmpiricalPowerModel {
    /// Creates empirical power model from 11 measured power values.
    pub fn new(points: Vec<f64>) -> Self {
        assert_eq!(points.len(), 11, "expected power values for 0%, 10%, ..., 100% utilization");
        Self { points }
    }
}

impl HostPowerModel for EmpiricalPowerModel {
    fn power(&self, utilization: f64) -> f64 {
        let utilization = utilization.clamp(0., 1.);
        let pos = utilization * 10.;
        let idx = pos.floor() as usize;
        if idx >= self.points.len() - 1 {
            return self.points[self.points.len() - 1];
        }
        let fraction = pos - idx as f64;
        self.points[idx] + (self.points[idx + 1] - self.points[idx]) * fraction
    }

    fn max_power(&self) -> f64 {
        self.points[self.points.len() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_power_model() {
        let model = LinearPowerModel::new(250., 100.);
        assert_eq!(model.power(0.), 100.);
        assert_eq!(model.power(1.), 250.);
        assert_eq!(model.power(0.5), 175.);
        assert_eq!(model.max_power(), 250.);
    }

    #[test]
    fn test_empirical_power_model() {
        let points = vec![93.7, 97., 101., 105., 110., 116., 121., 125., 129., 133., 135.];
        let model = EmpiricalPowerModel::new(points);
        assert_eq!(model.power(0.), 93.7);
        assert_eq!(model.power(1.), 135.);
        assert_eq!(model.power(0.3), 105.);
        // halfway between the 30% and 40% measurements
        assert!((model.power(0.35) - 107.5).abs() < 1e-9);
    }
}
