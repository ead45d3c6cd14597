//! Microphone capture into a lock-free ring buffer.
//!
//! The capture callback runs on the audio hardware thread: it converts
//! samples to 16-bit mono PCM at the configured rate, appends them to the
//! ring buffer, and updates the loudness meter. It never performs I/O and
//! never blocks.

pub mod capture;
pub mod ring_buffer;

use serde::{Deserialize, Serialize};

/// One input device as shown to the GUI device picker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub id: i32,
    pub name: String,
}

/// Instantaneous loudness of a chunk of PCM16 samples.
///
/// Log-scaled RMS mapped to 0–100 for UI metering.
pub fn loudness_level(samples: &[i16]) -> u8 {
    if samples.is_empty() {
        return 0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_sq / samples.len() as f64).sqrt();
    let relative = rms / 32767.0;
    if relative <= 0.0 {
        return 0;
    }
    let level = ((relative * 1000.0 + 1.0).log10() / 3.0 * 100.0).round();
    level.clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_is_level_zero() {
        assert_eq!(loudness_level(&[0i16; 512]), 0);
        assert_eq!(loudness_level(&[]), 0);
    }

    #[test]
    fn full_scale_is_level_one_hundred() {
        let loud = vec![i16::MAX; 512];
        assert_eq!(loudness_level(&loud), 100);
    }

    #[test]
    fn level_grows_with_amplitude() {
        let quiet = vec![300i16; 512];
        let mid = vec![3000i16; 512];
        let q = loudness_level(&quiet);
        let m = loudness_level(&mid);
        assert!(q > 0);
        assert!(m > q);
        assert!(m < 100);
    }
}
