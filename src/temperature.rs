//! Sensor temperature regulation.
//!
//! The cooler's control loop runs in the camera firmware; this module only
//! writes the setpoint and polls the sensor until it reports a temperature
//! inside the tolerance band. All waits are bounded, so a cooler that cannot
//! reach the target delays the sweep but never stalls it.

use std::{thread::sleep, time::Duration};

use log::{info, warn};

use crate::device::{CameraDevice, ControlId, QhyError};

/// Full-scale value of the cooler PWM reading.
const PWM_FULL_SCALE: f64 = 255.0;

/// Target sensor temperature and the accepted deviation, in °C.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureTarget {
    pub target_celsius: f64,
    pub tolerance_celsius: f64,
}

impl TemperatureTarget {
    /// Whether `celsius` lies within the tolerance band.
    pub fn within(&self, celsius: f64) -> bool {
        (celsius - self.target_celsius).abs() <= self.tolerance_celsius
    }
}

/// Polling cadence and bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegulatorTiming {
    /// Consecutive in-band check cycles required to call the sensor settled.
    pub settle_checks: u32,
    /// Wait at the start of every check cycle.
    pub check_interval: Duration,
    /// Wait between polls while the sensor is outside the band.
    pub poll_interval: Duration,
    /// Poll budget of a single check cycle.
    pub max_polls_per_check: u32,
}

impl Default for RegulatorTiming {
    fn default() -> Self {
        Self {
            settle_checks: 3,
            check_interval: Duration::from_secs(1),
            poll_interval: Duration::from_secs(2),
            max_polls_per_check: 150,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegulatorState {
    /// No regulation requested.
    Idle,
    /// Measured temperature outside the tolerance band.
    Converging,
    /// Measured temperature within the tolerance band.
    Settled,
}

/// Result of one [`TemperatureRegulator::regulate`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegulationOutcome {
    /// Settled within tolerance.
    Settled { temperature: f64, polls: u32 },
    /// Retry budget exhausted; the sweep proceeds at this temperature.
    Unsettled { temperature: Option<f64>, polls: u32 },
    /// The cooler setpoint could not be written.
    SetpointFailed(QhyError),
}

impl RegulationOutcome {
    pub fn is_settled(&self) -> bool {
        matches!(self, RegulationOutcome::Settled { .. })
    }

    /// Last measured temperature, if any.
    pub fn temperature(&self) -> Option<f64> {
        match *self {
            RegulationOutcome::Settled { temperature, .. } => Some(temperature),
            RegulationOutcome::Unsettled { temperature, .. } => temperature,
            RegulationOutcome::SetpointFailed(_) => None,
        }
    }
}

/// Drives the sensor toward a [`TemperatureTarget`].
#[derive(Debug, Clone)]
pub struct TemperatureRegulator {
    timing: RegulatorTiming,
    state: RegulatorState,
}

impl TemperatureRegulator {
    pub fn new(timing: RegulatorTiming) -> Self {
        Self {
            timing,
            state: RegulatorState::Idle,
        }
    }

    pub fn state(&self) -> RegulatorState {
        self.state
    }

    pub fn timing(&self) -> &RegulatorTiming {
        &self.timing
    }

    /// Write the setpoint and wait, within the configured budget, for the
    /// sensor to settle.
    pub fn regulate<D: CameraDevice>(
        &mut self,
        dev: &mut D,
        target: &TemperatureTarget,
    ) -> RegulationOutcome {
        if let Err(e) = dev.set_param(ControlId::Cooler, target.target_celsius) {
            warn!(
                "Could not set the cooler to {:.2} C: {e}",
                target.target_celsius
            );
            self.state = RegulatorState::Idle;
            return RegulationOutcome::SetpointFailed(e);
        }
        self.state = RegulatorState::Converging;

        let mut current = read_temperature(dev);
        if let Some(t) = current.filter(|t| target.within(*t)) {
            self.state = RegulatorState::Settled;
            info!("Camera temperature settled at {t:.2} C");
            return RegulationOutcome::Settled {
                temperature: t,
                polls: 0,
            };
        }

        let mut polls = 0;
        let mut consecutive = 0;
        for check in 0..self.timing.settle_checks {
            sleep(self.timing.check_interval);
            current = read_temperature(dev);
            let mut cycle_polls = 0;
            while !current.is_some_and(|t| target.within(t)) {
                if cycle_polls >= self.timing.max_polls_per_check {
                    warn!(
                        "Check {}/{}: temperature did not reach {:.2} C within {} polls",
                        check + 1,
                        self.timing.settle_checks,
                        target.target_celsius,
                        cycle_polls
                    );
                    break;
                }
                report_progress(dev, current, target);
                sleep(self.timing.poll_interval);
                current = read_temperature(dev);
                cycle_polls += 1;
            }
            polls += cycle_polls;
            if current.is_some_and(|t| target.within(t)) {
                consecutive += 1;
            } else {
                consecutive = 0;
            }
        }

        match current {
            Some(t) if consecutive >= self.timing.settle_checks && target.within(t) => {
                self.state = RegulatorState::Settled;
                info!("Camera temperature set to {:.2} C", target.target_celsius);
                RegulationOutcome::Settled {
                    temperature: t,
                    polls,
                }
            }
            temperature => {
                warn!(
                    "Proceeding without settling: temperature {} C, target {:.2} +/- {:.2} C",
                    temperature.map_or_else(|| "unknown".to_string(), |t| format!("{t:.2}")),
                    target.target_celsius,
                    target.tolerance_celsius
                );
                RegulationOutcome::Unsettled { temperature, polls }
            }
        }
    }
}

fn read_temperature<D: CameraDevice>(dev: &mut D) -> Option<f64> {
    dev.get_param(ControlId::CurTemp)
        .map_err(|e| warn!("Could not read the sensor temperature: {e}"))
        .ok()
}

fn report_progress<D: CameraDevice>(
    dev: &mut D,
    current: Option<f64>,
    target: &TemperatureTarget,
) {
    let Some(current) = current else {
        return;
    };
    let direction = if current > target.target_celsius {
        "cooling down"
    } else {
        "heating up"
    };
    info!(
        "Current temperature: {current:.2} C || target: {:.2} C. Camera is {direction}.",
        target.target_celsius
    );
    match dev.get_param(ControlId::CurPwm) {
        Ok(pwm) => info!(
            "Cooler PWM is {pwm:.1}, running at {:.1}% of full power.",
            pwm / PWM_FULL_SCALE * 100.0
        ),
        Err(e) => warn!("Could not read cooler PWM: {e}"),
    }
}
