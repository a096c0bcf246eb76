//! Simulation configuration.

use serde::{Deserialize, Serialize};

use dcsim_core::EPSILON;

/// Auxiliary structure to parse SimulationConfig from file
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct SimulationConfigRaw {
    /// duration between datacenter processing ticks
    pub scheduling_interval: Option<f64>,
    /// minimum delay between an event emission and its delivery
    pub min_event_gap: Option<f64>,
    /// use the oversubscription variant of host suitability checks
    pub oversubscribe: Option<bool>,
    /// hard termination time (0 means no limit)
    pub simulation_limit: Option<f64>,
    /// suppress calls to the allocation policy optimization
    pub disable_migrations: Option<bool>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct SimulationConfig {
    /// duration between datacenter processing ticks
    pub scheduling_interval: f64,
    /// minimum delay between an event emission and its delivery
    pub min_event_gap: f64,
    /// use the oversubscription variant of host suitability checks
    pub oversubscribe: bool,
    /// hard termination time (0 means no limit)
    pub simulation_limit: f64,
    /// suppress calls to the allocation policy optimization
    pub disable_migrations: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            scheduling_interval: 300.,
            min_event_gap: EPSILON,
            oversubscribe: true,
            simulation_limit: 0.,
            disable_migrations: false,
        }
    }
}

impl SimulationConfig {
    /// Creates simulation config by reading parameter values from .yaml file
    /// (uses default values if some parameters are absent).
    pub fn from_file(file_name: &str) -> Self {
        let raw: SimulationConfigRaw = serde_yaml::from_str(
            &std::fs::read_to_string(file_name).unwrap_or_else(|_| panic!("Can't read file {}", file_name)),
        )
        .unwrap_or_else(|_| panic!("Can't parse YAML from file {}", file_name));
        Self::from_raw(raw)
    }

    fn from_raw(raw: SimulationConfigRaw) -> Self {
        let defaults = Self::default();
        Self {
            scheduling_interval: raw.scheduling_interval.unwrap_or(defaults.scheduling_interval),
            min_event_gap: raw.min_event_gap.unwrap_or(defaults.min_event_gap),
            oversubscribe: raw.oversubscribe.unwrap_or(defaults.oversubscribe),
            simulation_limit: raw.simulation_limit.unwrap_or(defaults.simulation_limit),
            disable_migrations: raw.disable_migrations.unwrap_or(defaults.disable_migrations),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SimulationConfig::default();
        assert_eq!(config.scheduling_interval, 300.);
        assert!(config.min_event_gap > 0.);
        assert!(config.oversubscribe);
        assert!(!config.disable_migrations);
    }

    #[test]
    fn test_from_raw_overrides() {
        let raw: SimulationConfigRaw = serde_yaml::from_str(
            "scheduling_interval: 10\n\
             oversubscribe: false\n\
             disable_migrations: true\n",
        )
        .unwrap();
        let config = SimulationConfig::from_raw(raw);
        assert_eq!(config.scheduling_interval, 10.);
        assert!(!config.oversubscribe);
        assert!(config.disable_migrations);
        assert_eq!(config.simulation_limit, 0.);
    }
}
