//! Instrument (voice) data model consumed by the controller.
//!
//! A voice library is an ordered list of programs addressed by
//! `(bank MSB, bank LSB, program)`, optionally narrowed by drum note. Each FM
//! program carries the channel-level routing parameters and four operator
//! parameter blocks, all in register value domains.

/// Synthesis method of a voice program.
///
/// Only FM voices are synthesized by this crate; other types are skipped by
/// the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceType {
    /// Four-operator FM synthesis.
    #[default]
    Fm,
    /// Sampled (PCM) voice - not synthesized here.
    Pcm,
}

/// Per-operator voice parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperatorPatch {
    /// Tremolo (amplitude LFO) enable.
    pub eam: bool,
    /// Vibrato (pitch LFO) enable.
    pub evb: bool,
    /// Tremolo depth, 0..=3.
    pub dam: u8,
    /// Vibrato depth, 0..=3.
    pub dvb: u8,
    /// Detune, 0..=7.
    pub dt: u8,
    /// Key-scale level, 0..=3.
    pub ksl: u8,
    /// Key-scale rate enable.
    pub ksr: bool,
    /// Waveform select, 0..=7.
    pub ws: u8,
    /// Frequency multiplier, 0..=15.
    pub mult: u8,
    /// Self-feedback level, 0..=7; meaningful on operators 1 and 3 only.
    pub fb: u8,
    /// Attack rate, 0..=15.
    pub ar: u8,
    /// Decay rate, 0..=15.
    pub dr: u8,
    /// Sustain level, 0..=15.
    pub sl: u8,
    /// Sustain-stage decay rate, 0..=15.
    pub sr: u8,
    /// Release rate, 0..=15.
    pub rr: u8,
    /// Total level (attenuation), 0..=0x3f.
    pub tl: u8,
    /// Sustain-hold disable: keep decaying at SR while the key is held.
    pub xof: bool,
}

/// Channel-level FM parameters plus the four operator patches.
#[derive(Debug, Clone, Default)]
pub struct FmVoice {
    /// Algorithm select, 0..=7.
    pub alg: u8,
    /// LFO frequency select, 0..=7.
    pub lfo: u8,
    /// Voice-level pan offset, 0..=31 with 15 neutral.
    pub panpot: u8,
    /// Block offset (basic octave), 0..=3.
    pub bo: u8,
    /// Note substituted for the played note on drum voices.
    pub drum_key: u8,
    /// Operator parameter blocks, in slot order.
    pub operators: [OperatorPatch; 4],
}

/// One program in a voice library.
#[derive(Debug, Clone, Default)]
pub struct VoiceProgram {
    /// Bank select MSB.
    pub bank_msb: u8,
    /// Bank select LSB.
    pub bank_lsb: u8,
    /// Program number.
    pub program: u8,
    /// Non-zero marks a drum voice matched by this note number.
    pub drum_note: u8,
    /// Synthesis method; only [`VoiceType::Fm`] sounds.
    pub voice_type: VoiceType,
    /// FM synthesis parameters.
    pub fm: FmVoice,
}

/// An ordered list of voice programs.
#[derive(Debug, Clone, Default)]
pub struct VoiceLibrary {
    /// Programs in lookup order; earlier entries win on bank/program ties.
    pub programs: Vec<VoiceProgram>,
}

impl VoiceLibrary {
    /// Create a library from a program list.
    pub fn new(programs: Vec<VoiceProgram>) -> Self {
        Self { programs }
    }
}
