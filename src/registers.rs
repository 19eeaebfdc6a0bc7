//! Register-write boundary between the controller and the chip.
//!
//! The MA-5 register map is modelled as a two-axis address space rather than
//! a flat byte array: one enum selects a channel-level field, the other an
//! operator-level field. A [`Registers`] implementation is the write side of
//! a chip; the controller is written against the trait so it can drive a real
//! [`Chip`](crate::Chip) or any stand-in.

/// Channel-axis register selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelReg {
    /// Key on/off (0 = off, non-zero = on).
    Kon,
    /// Frequency block (octave), 0..=7. Saturates.
    Block,
    /// Frequency number, 0..=1023.
    Fnum,
    /// Algorithm select, 0..=7.
    Alg,
    /// LFO frequency select, 0..=7.
    Lfo,
    /// Voice-level pan offset, 0..=31 with 15 neutral.
    Panpot,
    /// MIDI channel pan, 0..=127.
    Chpan,
    /// MIDI channel volume, 0..=127.
    Volume,
    /// MIDI expression, 0..=127.
    Expression,
    /// Block offset (basic octave), 0..=3.
    Bo,
    /// Channel velocity attenuation input, 0..=127.
    Velocity,
}

/// Operator-axis register selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpReg {
    /// Tremolo (amplitude LFO) enable.
    Eam,
    /// Vibrato (pitch LFO) enable.
    Evb,
    /// Tremolo depth, 0..=3.
    Dam,
    /// Vibrato depth, 0..=3.
    Dvb,
    /// Detune, 0..=7.
    Dt,
    /// Key-scale level, 0..=3.
    Ksl,
    /// Key-scale rate enable.
    Ksr,
    /// Waveform select, 0..=7.
    Ws,
    /// Frequency multiplier, 0..=15.
    Mult,
    /// Self-feedback level, 0..=7.
    Fb,
    /// Attack rate, 0..=15.
    Ar,
    /// Decay rate, 0..=15.
    Dr,
    /// Sustain level, 0..=15.
    Sl,
    /// Sustain-stage decay rate, 0..=15.
    Sr,
    /// Release rate, 0..=15.
    Rr,
    /// Total level (attenuation), 0..=0x3f.
    Tl,
    /// Sustain-hold disable: keep decaying at SR while the key is held.
    Xof,
}

/// Address-space style write interface consumed by the controller.
///
/// Writes must be observable by the next sample the implementation produces.
/// Out-of-range values are never an error: implementations saturate where the
/// hardware saturates (pan, block) and mask to the field width otherwise.
/// Writes to channels beyond the implementation's channel count are ignored.
pub trait Registers {
    /// Write a channel-axis register on `channel`.
    fn write_channel(&mut self, channel: usize, reg: ChannelReg, value: i32);

    /// Write an operator-axis register on operator `op` (0..=3) of `channel`.
    fn write_operator(&mut self, channel: usize, op: usize, reg: OpReg, value: i32);

    /// Write a velocity-modulated total level to operator `op` of `channel`.
    ///
    /// `carrier_tl` lands on operators that are carriers under the channel's
    /// current algorithm; all others receive `modulator_tl` unchanged.
    fn write_tl(&mut self, channel: usize, op: usize, carrier_tl: i32, modulator_tl: i32);
}
