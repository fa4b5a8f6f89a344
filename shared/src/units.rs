/*!
Conversions between physical units and KStat instrument codes.

The DAC spans ±2048 mV over 16 bits with its zero at code 32768. Currents
come back as 24-bit ADC counts scaled by the PGA gain and the transimpedance
(IV) resistor. The constants here have to match the firmware exactly or
recorded data stops lining up.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::protocol::{ADC_FULL_SCALE, DAC_CODES_PER_MV, DAC_ZERO_OFFSET};

/// Convert millivolts to an absolute DAC code (truncating toward zero)
pub fn mv_to_dac(mv: f64) -> i32 {
    (mv * DAC_CODES_PER_MV + DAC_ZERO_OFFSET) as i32
}

/// Convert a rate or step in mV (mV/s, mV per step) to relative DAC codes
pub fn slope_to_dac(mv: f64) -> i32 {
    (mv * DAC_CODES_PER_MV) as i32
}

/// Convert an absolute DAC code back to millivolts
pub fn dac_to_mv(dac: i32) -> f64 {
    (dac as f64 - DAC_ZERO_OFFSET) * (4096.0 / 65536.0)
}

/// Convert an ADC count to amperes.
///
/// `POT_GAIN_0` has no resistor, so the result is not finite for it.
pub fn adc_to_amps(adc: i32, pga: PgaGain, iv: IvGain) -> f64 {
    (adc as f64 / (pga.value() as f64 / 2.0)) * (2.0 / iv.ohms() / ADC_FULL_SCALE)
}

/// Convert an ADC count to millivolts (potentiometric readings)
pub fn adc_to_mv(adc: i32, pga: PgaGain) -> f64 {
    (adc as f64 / (pga.value() as f64 / 2.0)) * (2000.0 / ADC_FULL_SCALE)
}

/// Error for unit names that are not in the instrument's tables
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownSetting {
    pub kind: &'static str,
    pub value: String,
}

/// Transimpedance amplifier setting, named by nominal resistance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IvGain {
    Gain0,
    Gain100,
    Gain3K,
    Gain30K,
    Gain300K,
    Gain3M,
    Gain30M,
    Gain100M,
}

impl IvGain {
    pub const ALL: [IvGain; 8] = [
        Self::Gain0,
        Self::Gain100,
        Self::Gain3K,
        Self::Gain30K,
        Self::Gain300K,
        Self::Gain3M,
        Self::Gain30M,
        Self::Gain100M,
    ];

    /// Firmware name of the setting
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gain0 => "POT_GAIN_0",
            Self::Gain100 => "POT_GAIN_100",
            Self::Gain3K => "POT_GAIN_3K",
            Self::Gain30K => "POT_GAIN_30K",
            Self::Gain300K => "POT_GAIN_300K",
            Self::Gain3M => "POT_GAIN_3M",
            Self::Gain30M => "POT_GAIN_30M",
            Self::Gain100M => "POT_GAIN_100M",
        }
    }

    /// Feedback resistance in ohms
    pub fn ohms(self) -> f64 {
        match self {
            Self::Gain0 => 0.0,
            Self::Gain100 => 100.0,
            Self::Gain3K => 3_000.0,
            Self::Gain30K => 30_000.0,
            Self::Gain300K => 300_000.0,
            Self::Gain3M => 3_000_000.0,
            Self::Gain30M => 30_000_000.0,
            Self::Gain100M => 100_000_000.0,
        }
    }

    /// Index sent with the `EG` command
    pub fn index(self) -> u8 {
        self as u8
    }
}

impl FromStr for IvGain {
    type Err = UnknownSetting;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| UnknownSetting { kind: "IV gain", value: s.to_string() })
    }
}

impl TryFrom<String> for IvGain {
    type Error = UnknownSetting;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IvGain> for String {
    fn from(g: IvGain) -> Self {
        g.as_str().to_string()
    }
}

impl fmt::Display for IvGain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Programmable gain amplifier multiplier (1, 2, 4 ... 64)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PgaGain(u8);

impl PgaGain {
    pub fn new(value: u8) -> Option<Self> {
        matches!(value, 1 | 2 | 4 | 8 | 16 | 32 | 64).then_some(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for PgaGain {
    fn default() -> Self {
        Self(2)
    }
}

impl TryFrom<u8> for PgaGain {
    type Error = UnknownSetting;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| UnknownSetting { kind: "PGA gain", value: value.to_string() })
    }
}

impl From<PgaGain> for u8 {
    fn from(g: PgaGain) -> Self {
        g.0
    }
}

/// ADS1255 sampling rates and their register codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SampleRate {
    Hz2_5,
    Hz5,
    Hz10,
    Hz15,
    Hz25,
    Hz30,
    Hz50,
    Hz60,
    Hz100,
    Hz500,
    KHz1,
    KHz2,
    KHz3_75,
    KHz7_5,
    KHz15,
    KHz30,
}

impl SampleRate {
    const TABLE: [(SampleRate, &'static str, &'static str); 16] = [
        (Self::Hz2_5, "2.5Hz", "3"),
        (Self::Hz5, "5Hz", "13"),
        (Self::Hz10, "10Hz", "23"),
        (Self::Hz15, "15Hz", "33"),
        (Self::Hz25, "25Hz", "43"),
        (Self::Hz30, "30Hz", "53"),
        (Self::Hz50, "50Hz", "63"),
        (Self::Hz60, "60Hz", "72"),
        (Self::Hz100, "100Hz", "82"),
        (Self::Hz500, "500Hz", "92"),
        (Self::KHz1, "1KHz", "A1"),
        (Self::KHz2, "2KHz", "B0"),
        (Self::KHz3_75, "3.75KHz", "C0"),
        (Self::KHz7_5, "7.5KHz", "D0"),
        (Self::KHz15, "15KHz", "E0"),
        // The firmware table tops out at E0
        (Self::KHz30, "30KHz", "E0"),
    ];

    fn entry(self) -> (SampleRate, &'static str, &'static str) {
        Self::TABLE[self as usize]
    }

    pub fn as_str(self) -> &'static str {
        self.entry().1
    }

    /// Register code sent with the `EA` command
    pub fn code(self) -> &'static str {
        self.entry().2
    }
}

impl FromStr for SampleRate {
    type Err = UnknownSetting;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::TABLE
            .iter()
            .find(|(_, name, _)| *name == s)
            .map(|(rate, _, _)| *rate)
            .ok_or_else(|| UnknownSetting { kind: "sample rate", value: s.to_string() })
    }
}

impl TryFrom<String> for SampleRate {
    type Error = UnknownSetting;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SampleRate> for String {
    fn from(r: SampleRate) -> Self {
        r.as_str().to_string()
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
