use crate::config::TopicConfig;
use crate::signals::Signal;
use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;

/// Minimum distance between the low and high pump thresholds, in percent.
pub const MIN_THRESHOLD_GAP: i32 = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ThresholdError {
    #[error("thresholds must be within 0..=100 (min {min}, max {max})")]
    OutOfRange { min: i32, max: i32 },
    #[error("max must be at least {gap} above min (min {min}, max {max})")]
    TooClose { min: i32, max: i32, gap: i32 },
    #[error("unknown pump '{0}'")]
    UnknownPump(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    Pump1,
    Pump2,
}

impl Pump {
    /// Threshold configuration topic of this pump.
    pub fn threshold_topic<'a>(&self, topics: &'a TopicConfig) -> &'a str {
        match self {
            Pump::Pump1 => &topics.thresholds_1,
            Pump::Pump2 => &topics.thresholds_2,
        }
    }
}

impl FromStr for Pump {
    type Err = ThresholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1" | "pump_1" => Ok(Pump::Pump1),
            "2" | "pump_2" => Ok(Pump::Pump2),
            other => Err(ThresholdError::UnknownPump(other.to_string())),
        }
    }
}

/// Fill-level percentages at which a pump switches on and off.
/// Serialized as `{"min": <int>, "max": <int>}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PumpThresholds {
    min: i32,
    max: i32,
}

impl PumpThresholds {
    pub fn new(min: i32, max: i32) -> Result<Self, ThresholdError> {
        if min < 0 || max > 100 {
            return Err(ThresholdError::OutOfRange { min, max });
        }
        if max - min < MIN_THRESHOLD_GAP {
            return Err(ThresholdError::TooClose {
                min,
                max,
                gap: MIN_THRESHOLD_GAP,
            });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> i32 {
        self.min
    }

    pub fn max(&self) -> i32 {
        self.max
    }
}

impl Default for PumpThresholds {
    fn default() -> Self {
        Self { min: 20, max: 80 }
    }
}

/// Tanks whose level is sampled into the history store.
pub const RECORDED_TANKS: [(&str, Signal); 2] = [
    ("tank_1", Signal::Tank1Level),
    ("tank_2", Signal::Tank2Level),
];

/// One stored tank level sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TankRecord {
    pub tank_id: String,
    pub level: f32,
    /// Unix time in milliseconds.
    pub timestamp: i64,
    pub readable_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelSummary {
    pub tank_id: String,
    pub count: i64,
    pub min: f64,
    pub max: f64,
    pub average: f64,
}
