//! The MA-5 chip: a fixed array of synthesis channels behind the register
//! interface.
//!
//! The chip has two entry points that must not be driven concurrently: the
//! [`Registers`] write side and the [`Chip::next`] sample pull. A write
//! observed before `next` returns sample `k` affects sample `k` in full.

use std::fmt;

use crate::channel::Channel;
use crate::registers::{ChannelReg, OpReg, Registers};
use crate::tables::CHANNEL_COUNT;
use crate::{Ma5Error, Result};

/// Default audio sample rate (44.1 kHz).
const DEFAULT_SAMPLE_RATE: f64 = 44_100.0;

/// MA-5 class FM synthesis chip.
///
/// # Example
///
/// ```
/// use ma5::{ChannelReg, Chip, OpReg, Registers};
///
/// let mut chip = Chip::new();
/// chip.write_channel(0, ChannelReg::Alg, 1);
/// chip.write_operator(0, 0, OpReg::Ar, 15);
/// chip.write_channel(0, ChannelReg::Fnum, 300);
/// chip.write_channel(0, ChannelReg::Block, 4);
/// chip.write_channel(0, ChannelReg::Velocity, 127);
/// chip.write_channel(0, ChannelReg::Kon, 1);
/// let frame = chip.next();
/// # let _ = frame;
/// ```
pub struct Chip {
    sample_rate: f64,
    channels: Vec<Channel>,
}

impl Chip {
    /// Create a chip with the default 44.1 kHz rate and 16 channels.
    pub fn new() -> Self {
        Self::build(DEFAULT_SAMPLE_RATE, CHANNEL_COUNT)
    }

    /// Create a chip with a custom sample rate and channel count.
    ///
    /// Neither can change after construction.
    ///
    /// # Errors
    ///
    /// Returns [`Ma5Error::ConfigError`] for a non-positive sample rate or a
    /// zero channel count.
    pub fn with_rate(sample_rate: f64, channel_count: usize) -> Result<Self> {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(Ma5Error::ConfigError(format!(
                "invalid sample rate: {sample_rate}"
            )));
        }
        if channel_count == 0 {
            return Err(Ma5Error::ConfigError(
                "channel count must be non-zero".into(),
            ));
        }
        Ok(Self::build(sample_rate, channel_count))
    }

    fn build(sample_rate: f64, channel_count: usize) -> Self {
        Self {
            sample_rate,
            channels: (0..channel_count)
                .map(|id| Channel::new(id, sample_rate))
                .collect(),
        }
    }

    /// Host sample rate in Hz.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Number of synthesis channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Reset every channel to its power-on state.
    pub fn reset(&mut self) {
        for channel in &mut self.channels {
            channel.reset_all();
        }
    }

    /// Produce one stereo frame: the sum of every channel's output, in linear
    /// amplitude. There are no inter-channel effects.
    pub fn next(&mut self) -> (f64, f64) {
        let mut left = 0.0;
        let mut right = 0.0;
        for channel in &mut self.channels {
            let (l, r) = channel.next();
            left += l;
            right += r;
        }
        (left, right)
    }

    #[cfg(test)]
    pub(crate) fn channel(&self, id: usize) -> &Channel {
        &self.channels[id]
    }
}

impl Default for Chip {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chip")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

impl Registers for Chip {
    fn write_channel(&mut self, channel: usize, reg: ChannelReg, value: i32) {
        let Some(ch) = self.channels.get_mut(channel) else {
            return;
        };
        match reg {
            ChannelReg::Kon => ch.set_kon(value),
            ChannelReg::Block => ch.set_block(value),
            ChannelReg::Fnum => ch.set_fnum(value),
            ChannelReg::Alg => ch.set_alg(value),
            ChannelReg::Lfo => ch.set_lfo(value),
            ChannelReg::Panpot => ch.set_panpot(value),
            ChannelReg::Chpan => ch.set_chpan(value),
            ChannelReg::Volume => ch.set_volume(value),
            ChannelReg::Expression => ch.set_expression(value),
            ChannelReg::Bo => ch.set_bo(value),
            ChannelReg::Velocity => ch.set_velocity(value),
        }
    }

    fn write_operator(&mut self, channel: usize, op: usize, reg: OpReg, value: i32) {
        let Some(ch) = self.channels.get_mut(channel) else {
            return;
        };
        let operator = ch.operator_mut(op);
        match reg {
            OpReg::Eam => operator.set_eam(value != 0),
            OpReg::Evb => operator.set_evb(value != 0),
            OpReg::Dam => operator.set_dam(value as u8),
            OpReg::Dvb => operator.set_dvb(value as u8),
            OpReg::Dt => operator.set_dt(value as u8),
            OpReg::Ksl => operator.set_ksl(value as u8),
            OpReg::Ksr => operator.set_ksr(value != 0),
            OpReg::Ws => operator.set_ws(value as u8),
            OpReg::Mult => operator.set_mult(value as u8),
            OpReg::Fb => operator.set_fb(value as u8),
            OpReg::Ar => operator.set_ar(value as u8),
            OpReg::Dr => operator.set_dr(value as u8),
            OpReg::Sl => operator.set_sl(value as u8),
            OpReg::Sr => operator.set_sr(value as u8),
            OpReg::Rr => operator.set_rr(value as u8),
            OpReg::Tl => operator.set_tl(value as u8),
            OpReg::Xof => operator.set_xof(value != 0),
        }
    }

    fn write_tl(&mut self, channel: usize, op: usize, carrier_tl: i32, modulator_tl: i32) {
        let Some(ch) = self.channels.get_mut(channel) else {
            return;
        };
        let tl = if ch.is_carrier(op) {
            carrier_tl
        } else {
            modulator_tl
        };
        ch.operator_mut(op).set_tl(tl as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program_sine(chip: &mut Chip, channel: usize) {
        chip.write_channel(channel, ChannelReg::Alg, 1);
        for op in 0..4 {
            chip.write_operator(channel, op, OpReg::Ar, 15);
            chip.write_operator(channel, op, OpReg::Sl, 0);
            chip.write_operator(channel, op, OpReg::Rr, 15);
            chip.write_operator(channel, op, OpReg::Mult, 1);
        }
        chip.write_channel(channel, ChannelReg::Fnum, 300);
        chip.write_channel(channel, ChannelReg::Block, 4);
        chip.write_channel(channel, ChannelReg::Velocity, 127);
    }

    #[test]
    fn test_new_chip_defaults() {
        let chip = Chip::new();
        assert_eq!(chip.sample_rate(), 44_100.0);
        assert_eq!(chip.channel_count(), CHANNEL_COUNT);
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        assert!(Chip::with_rate(0.0, 16).is_err());
        assert!(Chip::with_rate(-44_100.0, 16).is_err());
        assert!(Chip::with_rate(f64::NAN, 16).is_err());
        assert!(Chip::with_rate(44_100.0, 0).is_err());
        assert!(Chip::with_rate(96_000.0, 4).is_ok());
    }

    #[test]
    fn test_silent_until_keyed() {
        let mut chip = Chip::new();
        program_sine(&mut chip, 0);
        for _ in 0..1024 {
            assert_eq!(chip.next(), (0.0, 0.0));
        }
        chip.write_channel(0, ChannelReg::Kon, 1);
        let mut energy = 0.0;
        for _ in 0..1024 {
            let (l, r) = chip.next();
            energy += l * l + r * r;
        }
        assert!(energy > 0.0);
    }

    #[test]
    fn test_out_of_range_channel_is_ignored() {
        let mut chip = Chip::new();
        chip.write_channel(99, ChannelReg::Kon, 1);
        chip.write_operator(99, 0, OpReg::Ar, 15);
        chip.write_tl(99, 0, 0, 0);
        assert_eq!(chip.next(), (0.0, 0.0));
    }

    #[test]
    fn test_write_tl_selects_by_role() {
        let mut chip = Chip::new();
        // Algorithm 0: operator 0 modulates, operator 1 carries.
        chip.write_channel(0, ChannelReg::Alg, 0);
        chip.write_tl(0, 0, 0x10, 0x20);
        chip.write_tl(0, 1, 0x10, 0x20);
        assert!(!chip.channel(0).is_carrier(0));
        assert!(chip.channel(0).is_carrier(1));

        // The carrier follows the channel mix level; verify audibly: a
        // carrier TL of 0x3f mutes, 0x00 does not.
        program_sine(&mut chip, 1);
        chip.write_channel(1, ChannelReg::Kon, 1);
        chip.write_tl(1, 0, 0x3f, 0x3f);
        chip.write_tl(1, 1, 0x3f, 0x3f);
        let mut quiet = 0.0;
        for _ in 0..512 {
            let (l, _) = chip.next();
            quiet += l * l;
        }
        chip.write_tl(1, 0, 0, 0);
        chip.write_tl(1, 1, 0, 0);
        let mut loud = 0.0;
        for _ in 0..512 {
            let (l, _) = chip.next();
            loud += l * l;
        }
        assert!(loud > quiet * 100.0);
    }

    #[test]
    fn test_reset_silences() {
        let mut chip = Chip::new();
        program_sine(&mut chip, 0);
        chip.write_channel(0, ChannelReg::Kon, 1);
        for _ in 0..256 {
            chip.next();
        }
        chip.reset();
        for _ in 0..256 {
            assert_eq!(chip.next(), (0.0, 0.0));
        }
    }

    #[test]
    fn test_channels_mix_additively() {
        let mut solo = Chip::new();
        program_sine(&mut solo, 0);
        solo.write_channel(0, ChannelReg::Kon, 1);

        let mut duo = Chip::new();
        program_sine(&mut duo, 0);
        program_sine(&mut duo, 1);
        duo.write_channel(0, ChannelReg::Kon, 1);
        duo.write_channel(1, ChannelReg::Kon, 1);

        for _ in 0..256 {
            let (solo_l, _) = solo.next();
            let (duo_l, _) = duo.next();
            assert!((duo_l - 2.0 * solo_l).abs() < 1e-9);
        }
    }
}
