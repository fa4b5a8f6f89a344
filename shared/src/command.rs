/*!
Command frame construction.

A frame is a two-letter mnemonic, its arguments and a line terminator, joined
by single spaces. Potentials are given in millivolts and converted to DAC
codes here, so callers never handle raw codes.
*/

use std::fmt;

use crate::units::{mv_to_dac, slope_to_dac, IvGain, PgaGain, SampleRate};

/// Preconditioning steps the instrument runs before every sweep
///
/// The instrument holds `clean_mv` for `clean_s` seconds, then `deposit_mv`
/// for `deposit_s` seconds, then starts the scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preconditioning {
    pub clean_s: u32,
    pub deposit_s: u32,
    pub clean_mv: f64,
    pub deposit_mv: f64,
}

/// One command as sent over the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    mnemonic: &'static str,
    args: Vec<String>,
    terminator: &'static str,
}

impl CommandFrame {
    fn new(mnemonic: &'static str, args: Vec<String>, terminator: &'static str) -> Self {
        Self { mnemonic, args, terminator }
    }

    fn with_preconditioning(pre: &Preconditioning) -> Vec<String> {
        vec![
            pre.clean_s.to_string(),
            pre.deposit_s.to_string(),
            mv_to_dac(pre.clean_mv).to_string(),
            mv_to_dac(pre.deposit_mv).to_string(),
        ]
    }

    /// Hold the working electrode at a fixed potential
    ///
    /// Command: `EM <dac>`
    pub fn idle(mv: f64) -> Self {
        Self::new("EM", vec![mv_to_dac(mv).to_string()], "\r\n")
    }

    /// Configure the ADC
    ///
    /// Command: `EA <pga> <rate code> <buffer>`
    pub fn setup_adc(buffer: bool, rate: SampleRate, pga: PgaGain) -> Self {
        Self::new(
            "EA",
            vec![pga.value().to_string(), rate.code().to_string(), u8::from(buffer).to_string()],
            "\r\n",
        )
    }

    /// Select the transimpedance resistor
    ///
    /// Command: `EG <index>`
    pub fn set_gain(gain: IvGain) -> Self {
        Self::new("EG", vec![gain.index().to_string()], "\r\n")
    }

    /// Cyclic voltammetry
    ///
    /// Command: `EC <t1> <t2> <v1> <v2> <vertex> <end> <start> <scans> <slope>`
    pub fn cyclic(
        pre: &Preconditioning,
        vertex_mv: f64,
        end_mv: f64,
        start_mv: f64,
        scans: u32,
        slope_mv_s: f64,
    ) -> Self {
        let mut args = Self::with_preconditioning(pre);
        args.extend([
            mv_to_dac(vertex_mv).to_string(),
            mv_to_dac(end_mv).to_string(),
            mv_to_dac(start_mv).to_string(),
            scans.to_string(),
            slope_to_dac(slope_mv_s).to_string(),
        ]);
        Self::new("EC", args, "\r\n")
    }

    /// Linear sweep voltammetry
    ///
    /// Command: `EL <t1> <t2> <v1> <v2> <start> <stop> <slope>`
    pub fn linear_sweep(pre: &Preconditioning, start_mv: f64, stop_mv: f64, slope_mv_s: f64) -> Self {
        let mut args = Self::with_preconditioning(pre);
        args.extend([
            mv_to_dac(start_mv).to_string(),
            mv_to_dac(stop_mv).to_string(),
            slope_to_dac(slope_mv_s).to_string(),
        ]);
        Self::new("EL", args, "\r\n")
    }

    /// Differential pulse voltammetry
    ///
    /// Command: `ED <t1> <t2> <v1> <v2> <start> <stop> <step> <pulse> <period> <width>`
    #[allow(clippy::too_many_arguments)]
    pub fn differential_pulse(
        pre: &Preconditioning,
        start_mv: f64,
        stop_mv: f64,
        step_mv: f64,
        pulse_mv: f64,
        period_ms: u32,
        width_ms: u32,
    ) -> Self {
        let mut args = Self::with_preconditioning(pre);
        args.extend([
            mv_to_dac(start_mv).to_string(),
            mv_to_dac(stop_mv).to_string(),
            slope_to_dac(step_mv).to_string(),
            slope_to_dac(pulse_mv).to_string(),
            period_ms.to_string(),
            width_ms.to_string(),
        ]);
        // The DPV parser on the instrument only accepts a bare LF
        Self::new("ED", args, "\n")
    }

    /// Square wave voltammetry
    ///
    /// Command: `ES <t1> <t2> <v1> <v2> <start> <stop> <step> <pulse> <freq> <scans>`
    #[allow(clippy::too_many_arguments)]
    pub fn square_wave(
        pre: &Preconditioning,
        start_mv: f64,
        stop_mv: f64,
        step_mv: f64,
        pulse_mv: f64,
        frequency_hz: u32,
        scans: u32,
    ) -> Self {
        let mut args = Self::with_preconditioning(pre);
        args.extend([
            mv_to_dac(start_mv).to_string(),
            mv_to_dac(stop_mv).to_string(),
            slope_to_dac(step_mv).to_string(),
            slope_to_dac(pulse_mv).to_string(),
            frequency_hz.to_string(),
            scans.to_string(),
        ]);
        Self::new("ES", args, "\r\n")
    }

    pub fn mnemonic(&self) -> &'static str {
        self.mnemonic
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The bytes written to the link after a successful announcement
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut parts: Vec<&str> = Vec::with_capacity(self.args.len() + 2);
        parts.push(self.mnemonic);
        parts.extend(self.args.iter().map(String::as_str));
        parts.push(self.terminator);
        parts.join(" ").into_bytes()
    }

    /// Length announced in the `!{n}` handshake line.
    ///
    /// The firmware counts the body without a two byte terminator, even for
    /// frames ending in a bare LF.
    pub fn announced_len(&self) -> usize {
        self.to_bytes().len().saturating_sub(2)
    }
}

impl fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}
