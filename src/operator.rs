//! The FM operator: phase generator, envelope generator, and waveform
//! evaluation.
//!
//! An operator is the elementary oscillator of the chip. Its phase generator
//! is a 64-bit fixed-point accumulator whose top bits index one of the eight
//! waveform tables; its envelope generator is an ADSSR state machine in the
//! linear amplitude domain with key-scale-rate and key-scale-level applied.
//! One call to [`Operator::next`] advances both by one audio tick and
//! produces one signed sample.

use crate::tables::{
    self, Frac64, ATTACK_SECONDS, DAMP_DB_PER_SEC, DECAY_DB_PER_SEC, DT_MULTIPLIER,
    FEEDBACK_TABLE, MULT_TABLE, TREMOLO_COEF, VIBRATO_RATIO, WAVEFORMS, WAVEFORM_INDEX_SHIFT,
    WAVEFORM_LEN,
};

/// Envelope level below which a decaying stage collapses to exact silence.
const LEVEL_FLOOR: f64 = 1e-5;

/// Envelope generator stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvelopeStage {
    /// Terminal silence until the next key-on.
    #[default]
    Off,
    /// Rising toward the ceiling after key-on.
    Attack,
    /// Falling from the ceiling toward the sustain level.
    Decay,
    /// Holding (or, with XOF set, decaying at SR) until key-off.
    Sustain,
    /// Falling toward silence after key-off.
    Release,
    /// Fast forced release before re-keying a still-sounding operator.
    Damp,
}

/// Multi-stage envelope generator in the linear amplitude domain.
///
/// Attack raises the level additively toward the 1.0 ceiling; every falling
/// stage multiplies by a per-sample coefficient derived from a dB-per-second
/// rate. All rates are scaled by the key-scale-rate factor of the current
/// block/fnum, recomputed whenever a rate register or the frequency changes.
#[derive(Debug, Clone)]
pub struct EnvelopeGenerator {
    sample_rate: f64,
    /// Current stage.
    pub stage: EnvelopeStage,
    /// Instantaneous linear amplitude in `[0, 1]`.
    pub current_level: f64,
    /// Combined key-scale-level and total-level gain.
    pub ksl_tl_coef: f64,
    /// Tremolo enable.
    pub eam: bool,
    /// Tremolo depth, 0..=3.
    pub dam: u8,
    ar: u8,
    dr: u8,
    sl: u8,
    sr: u8,
    rr: u8,
    ksr: bool,
    xof: bool,
    tl: u8,
    ksl: u8,
    block: i32,
    fnum: i32,
    sustain_level: f64,
    attack_increment: f64,
    decay_coef: f64,
    sustain_coef: f64,
    release_coef: f64,
    damp_coef: f64,
}

impl EnvelopeGenerator {
    fn new(sample_rate: f64) -> Self {
        let mut eg = Self {
            sample_rate,
            stage: EnvelopeStage::Off,
            current_level: 0.0,
            ksl_tl_coef: 1.0,
            eam: false,
            dam: 0,
            ar: 0,
            dr: 0,
            sl: 0,
            sr: 0,
            rr: 0,
            ksr: false,
            xof: false,
            tl: 0,
            ksl: 0,
            block: 0,
            fnum: 0,
            sustain_level: 1.0,
            attack_increment: 0.0,
            decay_coef: 1.0,
            sustain_coef: 1.0,
            release_coef: 1.0,
            damp_coef: 0.0,
        };
        eg.damp_coef = eg.coef_for_db_per_sec(DAMP_DB_PER_SEC);
        eg.update_rates();
        eg.update_ksl_tl();
        eg
    }

    /// Return to silence, keeping the programmed parameters.
    pub fn reset(&mut self) {
        self.stage = EnvelopeStage::Off;
        self.current_level = 0.0;
    }

    /// Return to silence and restore parameter defaults.
    pub fn reset_all(&mut self) {
        self.reset();
        self.eam = false;
        self.dam = 0;
        self.ar = 0;
        self.dr = 0;
        self.sl = 0;
        self.sr = 0;
        self.rr = 0;
        self.ksr = false;
        self.xof = false;
        self.tl = 0;
        self.ksl = 0;
        self.block = 0;
        self.fnum = 0;
        self.update_sustain_level();
        self.update_rates();
        self.update_ksl_tl();
    }

    /// Advance one tick and return the linear amplitude.
    #[inline]
    pub fn tick(&mut self) -> f64 {
        match self.stage {
            EnvelopeStage::Off => {}
            EnvelopeStage::Attack => {
                self.current_level += self.attack_increment;
                if 1.0 <= self.current_level {
                    self.current_level = 1.0;
                    self.stage = EnvelopeStage::Decay;
                }
            }
            EnvelopeStage::Decay => {
                self.current_level *= self.decay_coef;
                if self.current_level <= self.sustain_level {
                    self.current_level = self.sustain_level;
                    self.stage = EnvelopeStage::Sustain;
                }
            }
            EnvelopeStage::Sustain => {
                if self.xof {
                    self.current_level *= self.sustain_coef;
                    if self.current_level <= LEVEL_FLOOR {
                        self.current_level = 0.0;
                        self.stage = EnvelopeStage::Off;
                    }
                }
            }
            EnvelopeStage::Release => {
                self.current_level *= self.release_coef;
                if self.current_level <= LEVEL_FLOOR {
                    self.current_level = 0.0;
                    self.stage = EnvelopeStage::Off;
                }
            }
            EnvelopeStage::Damp => {
                self.current_level *= self.damp_coef;
                if self.current_level <= LEVEL_FLOOR {
                    self.current_level = 0.0;
                    self.stage = EnvelopeStage::Attack;
                }
            }
        }
        self.current_level
    }

    /// Start the attack, damping first if the operator is still sounding.
    pub fn key_on(&mut self) {
        if self.current_level <= LEVEL_FLOOR {
            self.current_level = 0.0;
            self.stage = EnvelopeStage::Attack;
        } else {
            self.stage = EnvelopeStage::Damp;
        }
    }

    /// Enter the release stage.
    pub fn key_off(&mut self) {
        if self.stage != EnvelopeStage::Off {
            self.stage = EnvelopeStage::Release;
        }
    }

    fn set_ar(&mut self, v: u8) {
        self.ar = v & 0x0f;
        self.update_rates();
    }

    fn set_dr(&mut self, v: u8) {
        self.dr = v & 0x0f;
        self.update_rates();
    }

    fn set_sl(&mut self, v: u8) {
        self.sl = v & 0x0f;
        self.update_sustain_level();
    }

    fn set_sr(&mut self, v: u8) {
        self.sr = v & 0x0f;
        self.update_rates();
    }

    fn set_rr(&mut self, v: u8) {
        self.rr = v & 0x0f;
        self.update_rates();
    }

    fn set_ksr(&mut self, v: bool) {
        self.ksr = v;
        self.update_rates();
    }

    fn set_xof(&mut self, v: bool) {
        self.xof = v;
    }

    fn set_tl(&mut self, v: u8) {
        self.tl = v & 0x3f;
        self.update_ksl_tl();
    }

    fn set_ksl(&mut self, v: u8) {
        self.ksl = v & 3;
        self.update_ksl_tl();
    }

    /// Take the new block/fnum into the rate and level scaling.
    fn set_frequency_data(&mut self, block: i32, fnum: i32) {
        self.block = block;
        self.fnum = fnum;
        self.update_rates();
        self.update_ksl_tl();
    }

    fn update_sustain_level(&mut self) {
        // The bottom step means "all the way down" on this hardware family.
        let db = if self.sl >= 15 {
            93.0
        } else {
            3.0 * f64::from(self.sl)
        };
        self.sustain_level = 10f64.powf(-db / 20.0);
    }

    fn update_rates(&mut self) {
        let scale = tables::rate_scale(self.block, self.fnum, self.ksr);
        self.attack_increment = match self.ar {
            0 => 0.0,
            15.. => 1.0,
            ar => scale / (ATTACK_SECONDS[ar as usize] * self.sample_rate),
        };
        self.decay_coef = self.decay_coef_for(self.dr, scale);
        self.sustain_coef = self.decay_coef_for(self.sr, scale);
        self.release_coef = self.decay_coef_for(self.rr, scale);
    }

    fn decay_coef_for(&self, rate: u8, scale: f64) -> f64 {
        if rate == 0 {
            1.0
        } else {
            self.coef_for_db_per_sec(DECAY_DB_PER_SEC[(rate & 0x0f) as usize] * scale)
        }
    }

    fn coef_for_db_per_sec(&self, db_per_sec: f64) -> f64 {
        10f64.powf(-db_per_sec / (20.0 * self.sample_rate))
    }

    fn update_ksl_tl(&mut self) {
        let ksl_db = tables::ksl_attenuation_db(self.ksl, self.block, self.fnum);
        self.ksl_tl_coef = tables::total_level_coef(self.tl) * 10f64.powf(-ksl_db / 20.0);
    }
}

/// Fixed-point phase accumulator with frequency, multiplier, detune and
/// vibrato inputs.
#[derive(Debug, Clone)]
pub struct PhaseGenerator {
    sample_rate: f64,
    /// Vibrato enable.
    pub evb: bool,
    /// Vibrato depth, 0..=3.
    pub dvb: u8,
    dt: u8,
    mult: u8,
    fnum: i32,
    block: i32,
    bo: i32,
    phase: Frac64,
    increment: Frac64,
}

impl PhaseGenerator {
    fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            evb: false,
            dvb: 0,
            dt: 0,
            mult: 0,
            fnum: 0,
            block: 0,
            bo: 1,
            phase: 0,
            increment: 0,
        }
    }

    /// Rewind the accumulator to phase zero.
    pub fn reset(&mut self) {
        self.phase = 0;
    }

    /// Rewind and restore parameter defaults.
    pub fn reset_all(&mut self) {
        self.reset();
        self.evb = false;
        self.dvb = 0;
        self.dt = 0;
        self.mult = 0;
        self.fnum = 0;
        self.block = 0;
        self.bo = 1;
        self.increment = 0;
    }

    /// Recompute the per-sample increment from a new frequency encoding.
    pub fn set_frequency(&mut self, fnum: i32, block: i32, bo: i32) {
        self.fnum = fnum;
        self.block = block;
        self.bo = bo;
        self.update_increment();
    }

    fn set_mult(&mut self, v: u8) {
        self.mult = v & 0x0f;
        self.update_increment();
    }

    fn set_dt(&mut self, v: u8) {
        self.dt = v & 7;
        self.update_increment();
    }

    fn update_increment(&mut self) {
        let freq = self.fnum.max(0) as f64 * ((self.block + self.bo - 2) as f64).exp2()
            / tables::FNUM_COEF;
        let cycles = freq * MULT_TABLE[self.mult as usize] * DT_MULTIPLIER[self.dt as usize]
            / self.sample_rate;
        self.increment = tables::frac64_from_float(cycles);
    }

    /// Advance by one tick, applying vibrato, and return the new phase.
    #[inline]
    pub fn advance(&mut self, mod_index: usize) -> Frac64 {
        let mut increment = self.increment;
        if self.evb {
            let offset = self.increment as f64 * VIBRATO_RATIO[(self.dvb & 3) as usize][mod_index];
            increment = increment.wrapping_add(offset as i64 as u64);
        }
        self.phase = self.phase.wrapping_add(increment);
        self.phase
    }
}

/// One FM operator.
#[derive(Debug, Clone)]
pub struct Operator {
    /// Phase accumulator and frequency state.
    pub phase_generator: PhaseGenerator,
    /// Envelope state machine.
    pub envelope_generator: EnvelopeGenerator,
    /// Whether this slot feeds another operator under the current algorithm.
    pub is_modulator: bool,
    /// Self-feedback gain; zero while FB is 0.
    pub feedback_coef: f64,
    waveform: usize,
}

impl Operator {
    /// Create a silent operator for the given host sample rate.
    pub fn new(sample_rate: f64) -> Self {
        Self {
            phase_generator: PhaseGenerator::new(sample_rate),
            envelope_generator: EnvelopeGenerator::new(sample_rate),
            is_modulator: false,
            feedback_coef: 0.0,
            waveform: 0,
        }
    }

    /// Restore every parameter to its reset default.
    pub fn reset_all(&mut self) {
        self.phase_generator.reset_all();
        self.envelope_generator.reset_all();
        self.is_modulator = false;
        self.feedback_coef = 0.0;
        self.waveform = 0;
    }

    /// Key the operator on: phase rewinds and the envelope starts its attack
    /// (through a fast damp when the previous note is still sounding).
    pub fn key_on(&mut self) {
        self.phase_generator.reset();
        self.envelope_generator.key_on();
    }

    /// Key the operator off: the envelope enters release.
    pub fn key_off(&mut self) {
        self.envelope_generator.key_off();
    }

    /// Apply a new frequency encoding, preserving the envelope stage but
    /// re-deriving the key-scaled rates.
    pub fn set_frequency(&mut self, fnum: i32, block: i32, bo: i32) {
        self.phase_generator.set_frequency(fnum, block, bo);
        self.envelope_generator.set_frequency_data(block, fnum);
    }

    /// Set tremolo enable.
    pub fn set_eam(&mut self, v: bool) {
        self.envelope_generator.eam = v;
    }

    /// Set vibrato enable.
    pub fn set_evb(&mut self, v: bool) {
        self.phase_generator.evb = v;
    }

    /// Set tremolo depth.
    pub fn set_dam(&mut self, v: u8) {
        self.envelope_generator.dam = v & 3;
    }

    /// Set vibrato depth.
    pub fn set_dvb(&mut self, v: u8) {
        self.phase_generator.dvb = v & 3;
    }

    /// Set detune.
    pub fn set_dt(&mut self, v: u8) {
        self.phase_generator.set_dt(v);
    }

    /// Set key-scale level.
    pub fn set_ksl(&mut self, v: u8) {
        self.envelope_generator.set_ksl(v);
    }

    /// Set key-scale rate enable.
    pub fn set_ksr(&mut self, v: bool) {
        self.envelope_generator.set_ksr(v);
    }

    /// Set the waveform.
    pub fn set_ws(&mut self, v: u8) {
        self.waveform = (v & 7) as usize;
    }

    /// Set the frequency multiplier.
    pub fn set_mult(&mut self, v: u8) {
        self.phase_generator.set_mult(v);
    }

    /// Set the self-feedback level.
    pub fn set_fb(&mut self, v: u8) {
        self.feedback_coef = FEEDBACK_TABLE[(v & 7) as usize];
    }

    /// Set the attack rate.
    pub fn set_ar(&mut self, v: u8) {
        self.envelope_generator.set_ar(v);
    }

    /// Set the decay rate.
    pub fn set_dr(&mut self, v: u8) {
        self.envelope_generator.set_dr(v);
    }

    /// Set the sustain level.
    pub fn set_sl(&mut self, v: u8) {
        self.envelope_generator.set_sl(v);
    }

    /// Set the sustain-stage decay rate.
    pub fn set_sr(&mut self, v: u8) {
        self.envelope_generator.set_sr(v);
    }

    /// Set the release rate.
    pub fn set_rr(&mut self, v: u8) {
        self.envelope_generator.set_rr(v);
    }

    /// Set the total level.
    pub fn set_tl(&mut self, v: u8) {
        self.envelope_generator.set_tl(v);
    }

    /// Set the sustain-hold disable flag.
    pub fn set_xof(&mut self, v: bool) {
        self.envelope_generator.set_xof(v);
    }

    /// Advance one audio tick.
    ///
    /// `mod_index` is the channel's LFO table index for this tick;
    /// `modulator` is the modulating sample converted into a phase offset
    /// (zero where the topology applies none).
    #[inline]
    pub fn next(&mut self, mod_index: usize, modulator: f64) -> f64 {
        let level = self.envelope_generator.tick();
        let phase = self.phase_generator.advance(mod_index);
        if self.envelope_generator.stage == EnvelopeStage::Off {
            return 0.0;
        }
        let offset = tables::frac64_from_float(modulator);
        let index =
            (phase.wrapping_add(offset) >> WAVEFORM_INDEX_SHIFT) as usize & (WAVEFORM_LEN - 1);
        let mut sample = WAVEFORMS[self.waveform][index];
        if self.envelope_generator.eam {
            sample *= TREMOLO_COEF[(self.envelope_generator.dam & 3) as usize][mod_index];
        }
        sample * level * self.envelope_generator.ksl_tl_coef
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f64 = 44_100.0;

    fn keyed_operator(ar: u8, dr: u8, sl: u8, rr: u8) -> Operator {
        let mut op = Operator::new(RATE);
        op.set_ar(ar);
        op.set_dr(dr);
        op.set_sl(sl);
        op.set_rr(rr);
        op.set_mult(1);
        op.set_frequency(300, 4, 1);
        op.key_on();
        op
    }

    #[test]
    fn test_stage_progression() {
        let mut op = keyed_operator(12, 10, 4, 12);
        assert_eq!(op.envelope_generator.stage, EnvelopeStage::Attack);

        let mut reached_decay = false;
        let mut reached_sustain = false;
        for _ in 0..RATE as usize {
            op.next(0, 0.0);
            match op.envelope_generator.stage {
                EnvelopeStage::Decay => reached_decay = true,
                EnvelopeStage::Sustain => {
                    reached_sustain = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(reached_decay);
        assert!(reached_sustain);
        // SL=4 sustains at -12 dB.
        let expected = 10f64.powf(-12.0 / 20.0);
        assert!((op.envelope_generator.current_level - expected).abs() < 1e-9);

        op.key_off();
        assert_eq!(op.envelope_generator.stage, EnvelopeStage::Release);
        for _ in 0..RATE as usize {
            op.next(0, 0.0);
            if op.envelope_generator.stage == EnvelopeStage::Off {
                break;
            }
        }
        assert_eq!(op.envelope_generator.stage, EnvelopeStage::Off);
        assert_eq!(op.envelope_generator.current_level, 0.0);
    }

    #[test]
    fn test_level_bounds_and_attack_monotonic() {
        let mut op = keyed_operator(8, 6, 8, 10);
        let mut previous = 0.0;
        while op.envelope_generator.stage == EnvelopeStage::Attack {
            let level = op.envelope_generator.tick();
            assert!((0.0..=1.0).contains(&level));
            assert!(previous <= level, "attack must not fall");
            previous = level;
        }
        while op.envelope_generator.stage == EnvelopeStage::Decay {
            let level = op.envelope_generator.tick();
            assert!((0.0..=1.0).contains(&level));
            assert!(level <= previous, "decay must not rise");
            previous = level;
        }
    }

    #[test]
    fn test_instant_attack() {
        let mut op = keyed_operator(15, 0, 0, 15);
        op.next(0, 0.0);
        assert_eq!(op.envelope_generator.current_level, 1.0);
        // SL=0 sustains at the ceiling.
        op.next(0, 0.0);
        assert_eq!(op.envelope_generator.stage, EnvelopeStage::Sustain);
    }

    #[test]
    fn test_rekey_damps_before_attack() {
        let mut op = keyed_operator(15, 0, 0, 4);
        op.next(0, 0.0);
        assert_eq!(op.envelope_generator.current_level, 1.0);

        op.key_on();
        assert_eq!(op.envelope_generator.stage, EnvelopeStage::Damp);
        let mut ticks = 0;
        while op.envelope_generator.stage == EnvelopeStage::Damp {
            op.next(0, 0.0);
            ticks += 1;
            assert!(ticks < 1000, "damp must complete quickly");
        }
        assert_eq!(op.envelope_generator.stage, EnvelopeStage::Attack);
    }

    #[test]
    fn test_xof_decays_through_sustain() {
        let mut held = keyed_operator(15, 15, 8, 10);
        let mut fading = keyed_operator(15, 15, 8, 10);
        fading.set_sr(10);
        fading.set_xof(true);
        for _ in 0..4410 {
            held.next(0, 0.0);
            fading.next(0, 0.0);
        }
        assert!(fading.envelope_generator.current_level < held.envelope_generator.current_level);
    }

    #[test]
    fn test_ksr_speeds_up_release() {
        let mut low = keyed_operator(15, 0, 0, 6);
        let mut high = keyed_operator(15, 0, 0, 6);
        high.set_ksr(true);
        high.set_frequency(1023, 7, 1);
        low.set_frequency(300, 0, 1);
        low.next(0, 0.0);
        high.next(0, 0.0);
        low.key_off();
        high.key_off();
        for _ in 0..441 {
            low.next(0, 0.0);
            high.next(0, 0.0);
        }
        assert!(high.envelope_generator.current_level < low.envelope_generator.current_level);
    }

    #[test]
    fn test_frequency_update_preserves_stage() {
        let mut op = keyed_operator(15, 0, 0, 8);
        op.next(0, 0.0);
        let stage = op.envelope_generator.stage;
        op.set_frequency(512, 5, 1);
        assert_eq!(op.envelope_generator.stage, stage);
    }

    #[test]
    fn test_off_operator_is_silent() {
        let mut op = Operator::new(RATE);
        op.set_frequency(300, 4, 1);
        for _ in 0..64 {
            assert_eq!(op.next(0, 0.0), 0.0);
        }
    }

    #[test]
    fn test_sine_output_spans_both_signs() {
        let mut op = keyed_operator(15, 0, 0, 8);
        let mut min = 0.0f64;
        let mut max = 0.0f64;
        for _ in 0..1000 {
            let s = op.next(0, 0.0);
            min = min.min(s);
            max = max.max(s);
        }
        assert!(max > 0.5);
        assert!(min < -0.5);
    }

    #[test]
    fn test_modulator_input_shifts_phase() {
        let mut plain = keyed_operator(15, 0, 0, 8);
        let mut modulated = keyed_operator(15, 0, 0, 8);
        let mut differs = false;
        for _ in 0..100 {
            let a = plain.next(0, 0.0);
            let b = modulated.next(0, 0.25);
            if (a - b).abs() > 1e-9 {
                differs = true;
            }
        }
        assert!(differs);
    }

    #[test]
    fn test_total_level_attenuates() {
        let mut loud = keyed_operator(15, 0, 0, 8);
        let mut quiet = keyed_operator(15, 0, 0, 8);
        quiet.set_tl(0x3f);
        let mut loud_peak = 0.0f64;
        let mut quiet_peak = 0.0f64;
        for _ in 0..1000 {
            loud_peak = loud_peak.max(loud.next(0, 0.0).abs());
            quiet_peak = quiet_peak.max(quiet.next(0, 0.0).abs());
        }
        assert!(quiet_peak < loud_peak * 0.01);
    }
}
