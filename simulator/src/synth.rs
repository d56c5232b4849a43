use crate::telemetry::{Accelerometer, SensorReading, Sensors, Site, Status, SystemHealth};
use chrono::{DateTime, Utc};
use rand::Rng;

/// Chance per sample of a load spike large enough to trip the critical strain threshold
pub const SPIKE_PROBABILITY: f64 = 0.05;
pub const EARTH_GRAVITY: f64 = 9.8;

/// Round to a fixed number of decimal places
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Synthesize a plausible reading for wall-clock time `now`.
///
/// Strain follows a slow sinusoid with occasional spikes, vibration is a faster
/// sinusoid scaled by the current strain, temperature drifts very slowly around
/// 20°C.
pub fn synthesize(now: DateTime<Utc>, rng: &mut impl Rng, site: &Site) -> SensorReading {
    let t = now.timestamp_millis() as f64 * 0.001;

    let base_strain = 500.0 + (t * 0.1).sin() * 300.0;
    let spike = if rng.gen_bool(SPIKE_PROBABILITY) {
        rng.gen_range(0.0..1500.0)
    } else {
        0.0
    };
    let strain = (base_strain + spike + rng.gen_range(-50.0..50.0)).max(0.0);

    let vibration = ((t * 0.5).sin() * (1.0 + strain / 2000.0)).abs();
    let temperature = 20.0 + (t * 0.01).sin() * 5.0 + rng.gen_range(-1.0..1.0);

    let accelerometer = Accelerometer {
        x: round_to(rng.gen_range(-1.0..1.0), 2),
        y: round_to(rng.gen_range(-1.0..1.0), 2),
        z: round_to(EARTH_GRAVITY + rng.gen_range(-0.5..0.5), 2),
    };

    SensorReading {
        infrastructure_id: site.infrastructure_id.clone(),
        location: site.location.clone(),
        timestamp: now,
        status: Status::classify(strain, vibration, temperature),
        sensors: Sensors {
            strain: round_to(strain, 1),
            vibration: round_to(vibration, 1),
            temperature: round_to(temperature, 1),
            accelerometer,
        },
        system: SystemHealth {
            uptime: now.timestamp().max(0) as u64,
            free_memory: 1500 + rng.gen_range(0..500),
            battery_level: (95 - rng.gen_range(0..10)) as f64,
        },
    }
}
