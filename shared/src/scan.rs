/*!
Decoded voltammetry data.

Samples keep the raw instrument codes. Conversion to mV and amperes happens on
demand because it depends on the gains the measurement ran with.
*/

use crate::units::{adc_to_amps, dac_to_mv, IvGain, PgaGain};

/// Number of current readings per sample record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentShape {
    /// One current per step (cyclic and linear sweep)
    Single,
    /// Forward and backward current per step (pulse techniques)
    Dual,
}

impl CurrentShape {
    /// Bytes between the `B\n` tag and the record's trailing newline
    pub fn body_len(self) -> usize {
        match self {
            Self::Single => 2 + 4,
            Self::Dual => 2 + 4 + 4,
        }
    }
}

/// One decoded data point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSample {
    /// Potential as an absolute DAC code
    pub potential: u16,
    /// First (or only) current reading in ADC counts
    pub current: i32,
    /// Second current reading for pulse techniques
    pub backward: Option<i32>,
}

impl ScanSample {
    pub fn potential_mv(&self) -> f64 {
        dac_to_mv(self.potential as i32)
    }

    pub fn current_amps(&self, pga: PgaGain, iv: IvGain) -> f64 {
        adc_to_amps(self.current, pga, iv)
    }

    pub fn backward_amps(&self, pga: PgaGain, iv: IvGain) -> Option<f64> {
        self.backward.map(|b| adc_to_amps(b, pga, iv))
    }
}

/// One sweep worth of samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub shape: CurrentShape,
    pub samples: Vec<ScanSample>,
}

/// A scan converted to physical units, ready to be written out
#[derive(Debug, Clone, PartialEq)]
pub enum ScanSeries {
    Single {
        potential_mv: Vec<f64>,
        current_a: Vec<f64>,
    },
    Dual {
        potential_mv: Vec<f64>,
        forward_a: Vec<f64>,
        backward_a: Vec<f64>,
        /// Forward minus backward
        net_a: Vec<f64>,
    },
}

impl Scan {
    pub fn new(shape: CurrentShape, samples: Vec<ScanSample>) -> Self {
        Self { shape, samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Convert the raw codes with the gains the scan was recorded at
    pub fn to_series(&self, pga: PgaGain, iv: IvGain) -> ScanSeries {
        let potential_mv = self.samples.iter().map(ScanSample::potential_mv).collect();

        match self.shape {
            CurrentShape::Single => ScanSeries::Single {
                potential_mv,
                current_a: self.samples.iter().map(|s| s.current_amps(pga, iv)).collect(),
            },
            CurrentShape::Dual => {
                let forward_a: Vec<f64> = self.samples.iter().map(|s| s.current_amps(pga, iv)).collect();
                let backward_a: Vec<f64> = self
                    .samples
                    .iter()
                    .map(|s| s.backward_amps(pga, iv).unwrap_or(0.0))
                    .collect();
                let net_a = forward_a.iter().zip(&backward_a).map(|(f, b)| f - b).collect();

                ScanSeries::Dual {
                    potential_mv,
                    forward_a,
                    backward_a,
                    net_a,
                }
            }
        }
    }
}
