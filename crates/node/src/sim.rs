//! Greenhouse climate and nutrient simulator for local development.
//!
//! Models a small hydroponic greenhouse:
//! - Temperature and humidity as mean-reverting random walks
//! - A day/night temperature swing, with humidity moving against it
//! - Occasional sensor glitches
//! - Nutrient concentration (TDS, ppm) slowly depleting between dosings
//! - Closed-loop actuation: misting cools and humidifies while it runs

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6 ~ N(0,1).
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mild tropical day around 27 °C / 70 %.
    Steady,
    /// Hot and dry, trending upward. Useful for watching schedules cool it.
    Heatwave,
    /// Noisy readings with frequent glitches.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "heatwave" => Self::Heatwave,
            "flaky" => Self::Flaky,
            _ => Self::Steady,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steady => write!(f, "steady"),
            Self::Heatwave => write!(f, "heatwave"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

struct Walk {
    value: f64,
    center: f64,
    drift: f64,
    sigma: f64,
    reversion: f64,
}

impl Walk {
    fn step(&mut self, push: f64) -> f64 {
        let pull = self.reversion * (self.center - self.value);
        self.value += self.drift + pull + gaussian(0.0, self.sigma) + push;
        self.value
    }
}

/// One simulated sample of everything the node reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub temperature: f64,
    pub humidity: f64,
    pub tds_ppm: f64,
}

pub struct ClimateSim {
    temperature: Walk,
    humidity: Walk,
    tds: f64,
    glitch_prob: f32,
    diurnal_amplitude: f64,
    diurnal_period_s: f64,
    misting: bool,
    tick: u64,
}

impl ClimateSim {
    /// `diurnal_period_s` sets the day/night cycle length; 600 gives a fast
    /// cycle for dev work, 86400 is real time.
    pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
        let (t_center, t_drift, h_center, sigma, glitch_prob) = match scenario {
            Scenario::Steady => (27.0, 0.0, 70.0, 0.15, 0.005_f32),
            Scenario::Heatwave => (33.0, 0.05, 50.0, 0.2, 0.01),
            Scenario::Flaky => (27.0, 0.0, 70.0, 0.6, 0.10),
        };

        Self {
            temperature: Walk {
                value: t_center + gaussian(0.0, 0.5),
                center: t_center,
                drift: t_drift,
                sigma,
                reversion: 0.05,
            },
            humidity: Walk {
                value: h_center + gaussian(0.0, 2.0),
                center: h_center,
                drift: 0.0,
                sigma: sigma * 4.0,
                reversion: 0.05,
            },
            tds: 900.0,
            glitch_prob,
            diurnal_amplitude: 3.0,
            diurnal_period_s: diurnal_period_s.max(1.0),
            misting: false,
            tick: 0,
        }
    }

    /// Tell the simulator whether the misting pump is running.
    pub fn set_misting(&mut self, on: bool) {
        self.misting = on;
    }

    pub fn misting(&self) -> bool {
        self.misting
    }

    /// Advance one tick of `elapsed_s` seconds and read every sensor.
    pub fn sample(&mut self, elapsed_s: f64) -> Sample {
        self.tick += 1;
        let (cool, moisten) = if self.misting { (-0.4, 2.0) } else { (0.0, 0.0) };

        let t = self.temperature.step(cool);
        let h = self.humidity.step(moisten);

        let phase = 2.0 * std::f64::consts::PI * (self.tick as f64 * elapsed_s)
            / self.diurnal_period_s;
        let swing = phase.sin();

        let mut temperature = t + self.diurnal_amplitude * swing;
        let humidity = (h - 2.0 * self.diurnal_amplitude * swing).clamp(5.0, 100.0);
        if fastrand::f32() < self.glitch_prob {
            temperature += gaussian(0.0, 8.0);
        }

        // Uptake by the plants, then a top-up once it runs low.
        self.tds -= 0.5 + fastrand::f64();
        if self.tds < 600.0 {
            self.tds = 900.0;
        }

        Sample {
            temperature: temperature.clamp(-10.0, 60.0),
            humidity,
            tds_ppm: self.tds + gaussian(0.0, 3.0),
        }
    }
}

/// Composite climate payload, one decimal per field.
pub fn format_environment(temperature: f64, humidity: f64) -> String {
    format!("Suhu: {temperature:.1}\nKelembaban: {humidity:.1}")
}

// ===========================================================================
// Tests
// ===========================================================================
