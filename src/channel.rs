//! Synthesis channel: four operators routed by one of eight algorithms.
//!
//! ```text
//! ALG 0   (FB)1 -> 2 -> OUT
//!
//! ALG 1   (FB)1 -> | -> OUT
//!             2 -> |
//!
//! ALG 2   (FB)1 -> | -> OUT
//!             2 -> |
//!         (FB)3 -> |
//!             4 -> |
//!
//! ALG 3   (FB)1 ------> | -> 4 -> OUT
//!             2 -> 3 -> |
//!
//! ALG 4   (FB)1 -> 2 -> 3 -> 4 -> OUT
//!
//! ALG 5   (FB)1 -> 2 -> | -> OUT
//!         (FB)3 -> 4 -> |
//!
//! ALG 6   (FB)1 -----------> | -> OUT
//!             2 -> 3 -> 4 -> |
//!
//! ALG 7   (FB)1 ------> | -> OUT
//!             2 -> 3 -> |
//!             4 ------> |
//! ```
//!
//! Operators 1 and 3 are the only feedback sources. Their self-modulation is
//! an explicit one-sample delay line held by the channel: each sample blends
//! the previous and current feedback values with coefficients chosen so the
//! path keeps its perceived bandwidth when the chip runs above the reference
//! rate.

use std::fmt;

use crate::operator::{EnvelopeStage, Operator};
use crate::tables::{
    frac64_from_float, Frac64, CARRIER_MATRIX, LFO_HZ, MODULATOR_MATRIX, MODULATOR_MULTIPLIER,
    MOD_INDEX_SHIFT, MOD_TABLE_LEN, PAN_TABLE, REFERENCE_SAMPLE_RATE, VOLUME_TABLE,
};

/// Modulator input used where the topology applies none.
const NO_MODULATOR: f64 = 0.0;

/// One synthesis channel of the chip.
pub struct Channel {
    channel_id: usize,
    midi_channel_id: i32,
    sample_rate: f64,

    fnum: i32,
    kon: i32,
    block: i32,
    alg: usize,
    panpot: i32,
    chpan: i32,
    volume: i32,
    expression: i32,
    velocity: i32,
    bo: i32,

    feedback_blend_prev: f64,
    feedback_blend_curr: f64,
    feedback1_prev: f64,
    feedback1_curr: f64,
    feedback3_prev: f64,
    feedback3_curr: f64,
    feedback_out1: f64,
    feedback_out3: f64,
    attenuation_coef: f64,
    mod_index_frac64: Frac64,
    lfo_frequency: Frac64,
    pan_coef_l: f64,
    pan_coef_r: f64,

    operators: [Operator; 4],
}

impl Channel {
    /// Create channel `channel_id` for a chip running at `sample_rate`.
    pub fn new(channel_id: usize, sample_rate: f64) -> Self {
        // 48000Hz:     |prev|curr|
        // 44100Hz: | prev | curr |
        let feedback_blend_curr = (0.5 * REFERENCE_SAMPLE_RATE / sample_rate).min(1.0);

        let mut ch = Self {
            channel_id,
            midi_channel_id: -1,
            sample_rate,
            fnum: 0,
            kon: 0,
            block: 0,
            alg: 0,
            panpot: 15,
            chpan: 64,
            volume: 100,
            expression: 127,
            velocity: 0,
            bo: 1,
            feedback_blend_prev: 1.0 - feedback_blend_curr,
            feedback_blend_curr,
            feedback1_prev: 0.0,
            feedback1_curr: 0.0,
            feedback3_prev: 0.0,
            feedback3_curr: 0.0,
            feedback_out1: 0.0,
            feedback_out3: 0.0,
            attenuation_coef: 1.0,
            mod_index_frac64: 0,
            lfo_frequency: 0,
            pan_coef_l: 0.0,
            pan_coef_r: 0.0,
            operators: std::array::from_fn(|_| Operator::new(sample_rate)),
        };
        ch.reset_all();
        ch
    }

    /// Clear the running synthesis state: LFO phase, feedback lines, operator
    /// phases and envelopes. Programmed parameters survive.
    pub fn reset(&mut self) {
        self.mod_index_frac64 = 0;
        self.feedback1_prev = 0.0;
        self.feedback1_curr = 0.0;
        self.feedback3_prev = 0.0;
        self.feedback3_curr = 0.0;
        self.feedback_out1 = 0.0;
        self.feedback_out3 = 0.0;
        for op in &mut self.operators {
            op.phase_generator.reset();
            op.envelope_generator.reset();
        }
    }

    /// Reset the channel and all parameters to power-on defaults.
    pub fn reset_all(&mut self) {
        self.midi_channel_id = -1;
        self.fnum = 0;
        self.kon = 0;
        self.block = 0;
        self.alg = 0;
        self.panpot = 15;
        self.chpan = 64;
        self.volume = 100;
        self.expression = 127;
        self.velocity = 0;
        self.bo = 1;
        self.set_lfo(0);
        self.update_pan_coef();
        self.update_attenuation();
        for op in &mut self.operators {
            op.reset_all();
        }
    }

    /// True when every carrier of the current algorithm is in stage Off.
    pub fn is_off(&self) -> bool {
        for (i, op) in self.operators.iter().enumerate() {
            if !CARRIER_MATRIX[self.alg][i] {
                continue;
            }
            if op.envelope_generator.stage != EnvelopeStage::Off {
                return false;
            }
        }
        true
    }

    /// Loudest carrier envelope level, including key-scale/total-level gain.
    pub fn current_level(&self) -> f64 {
        let mut result = 0.0;
        for (i, op) in self.operators.iter().enumerate() {
            if CARRIER_MATRIX[self.alg][i] {
                let eg = &op.envelope_generator;
                let v = eg.current_level * eg.ksl_tl_coef;
                if result < v {
                    result = v;
                }
            }
        }
        result
    }

    /// Key the channel on or off. A final key-off that leaves every carrier
    /// silent resets the channel completely, releasing its controller
    /// binding.
    pub fn set_kon(&mut self, v: i32) {
        if v == 0 {
            self.key_off();
            if self.is_off() {
                self.reset_all();
            }
        } else {
            self.key_on();
        }
    }

    fn key_on(&mut self) {
        if self.kon != 0 {
            return;
        }
        for op in &mut self.operators {
            op.key_on();
        }
        self.kon = 1;
    }

    fn key_off(&mut self) {
        if self.kon == 0 {
            return;
        }
        for op in &mut self.operators {
            op.key_off();
        }
        self.kon = 0;
    }

    /// Set the frequency block. Saturates to 0..=7.
    pub fn set_block(&mut self, v: i32) {
        self.block = v.clamp(0, 7);
        self.update_frequency();
    }

    /// Set the frequency number.
    pub fn set_fnum(&mut self, v: i32) {
        self.fnum = v;
        self.update_frequency();
    }

    /// Select the algorithm. A change clears the feedback delay lines and
    /// resets operator phases and envelopes before the new routing becomes
    /// observable.
    pub fn set_alg(&mut self, v: i32) {
        let v = (v & 7) as usize;
        if self.alg != v {
            self.reset();
        }
        self.alg = v;
        self.feedback1_prev = 0.0;
        self.feedback1_curr = 0.0;
        self.feedback3_prev = 0.0;
        self.feedback3_curr = 0.0;
        for (i, op) in self.operators.iter_mut().enumerate() {
            op.is_modulator = MODULATOR_MATRIX[v][i];
        }
    }

    /// Select the LFO frequency.
    pub fn set_lfo(&mut self, v: i32) {
        self.lfo_frequency = frac64_from_float(LFO_HZ[(v & 7) as usize] / self.sample_rate);
    }

    /// Set the voice-level pan offset.
    pub fn set_panpot(&mut self, v: i32) {
        self.panpot = v & 0x1f;
        self.update_pan_coef();
    }

    /// Set the MIDI channel pan.
    pub fn set_chpan(&mut self, v: i32) {
        self.chpan = v & 0x7f;
        self.update_pan_coef();
    }

    fn update_pan_coef(&mut self) {
        let pan = (self.chpan + (self.panpot - 15) * 4).clamp(0, 127);
        self.pan_coef_l = PAN_TABLE[pan as usize][0];
        self.pan_coef_r = PAN_TABLE[pan as usize][1];
    }

    /// Set the channel volume.
    pub fn set_volume(&mut self, v: i32) {
        self.volume = v & 0x7f;
        self.update_attenuation();
    }

    /// Set the expression level.
    pub fn set_expression(&mut self, v: i32) {
        self.expression = v & 0x7f;
        self.update_attenuation();
    }

    /// Set the velocity attenuation input.
    pub fn set_velocity(&mut self, v: i32) {
        self.velocity = v & 0x7f;
        self.update_attenuation();
    }

    fn update_attenuation(&mut self) {
        self.attenuation_coef = VOLUME_TABLE[(self.volume >> 2) as usize]
            * VOLUME_TABLE[(self.expression >> 2) as usize]
            * VOLUME_TABLE[(self.velocity >> 2) as usize];
    }

    /// Set the block offset.
    pub fn set_bo(&mut self, v: i32) {
        self.bo = v & 3;
        self.update_frequency();
    }

    fn update_frequency(&mut self) {
        for op in &mut self.operators {
            op.set_frequency(self.fnum, self.block, self.bo);
        }
    }

    pub(crate) fn operator_mut(&mut self, index: usize) -> &mut Operator {
        &mut self.operators[index & 3]
    }

    pub(crate) fn is_carrier(&self, index: usize) -> bool {
        CARRIER_MATRIX[self.alg][index & 3]
    }

    /// Produce one stereo frame.
    pub fn next(&mut self) -> (f64, f64) {
        let mod_index = (self.mod_index_frac64 >> MOD_INDEX_SHIFT) as usize & (MOD_TABLE_LEN - 1);
        self.mod_index_frac64 = self.mod_index_frac64.wrapping_add(self.lfo_frequency);

        let mut op1_out = 0.0;
        let mut op3_out = 0.0;

        let result = match self.alg {
            0 => {
                // (FB)1 -> 2 -> OUT
                if self.operators[1].envelope_generator.stage == EnvelopeStage::Off {
                    return (0.0, 0.0);
                }

                op1_out = self.operators[0].next(mod_index, self.feedback_out1);

                self.operators[1].next(mod_index, op1_out * MODULATOR_MULTIPLIER)
            }

            1 => {
                // (FB)1 -> | -> OUT
                //     2 -> |
                if self.operators[0].envelope_generator.stage == EnvelopeStage::Off
                    && self.operators[1].envelope_generator.stage == EnvelopeStage::Off
                {
                    return (0.0, 0.0);
                }

                op1_out = self.operators[0].next(mod_index, self.feedback_out1);
                let op2_out = self.operators[1].next(mod_index, NO_MODULATOR);

                op1_out + op2_out
            }

            2 => {
                // (FB)1 -> | -> OUT
                //     2 -> |
                // (FB)3 -> |
                //     4 -> |
                if self.operators[0].envelope_generator.stage == EnvelopeStage::Off
                    && self.operators[1].envelope_generator.stage == EnvelopeStage::Off
                    && self.operators[2].envelope_generator.stage == EnvelopeStage::Off
                    && self.operators[3].envelope_generator.stage == EnvelopeStage::Off
                {
                    return (0.0, 0.0);
                }

                op1_out = self.operators[0].next(mod_index, self.feedback_out1);
                let op2_out = self.operators[1].next(mod_index, NO_MODULATOR);
                op3_out = self.operators[2].next(mod_index, self.feedback_out3);
                let op4_out = self.operators[3].next(mod_index, NO_MODULATOR);

                op1_out + op2_out + op3_out + op4_out
            }

            3 => {
                // (FB)1 ------> | -> 4 -> OUT
                //     2 -> 3 -> |
                if self.operators[3].envelope_generator.stage == EnvelopeStage::Off {
                    return (0.0, 0.0);
                }

                op1_out = self.operators[0].next(mod_index, self.feedback_out1);
                let op2_out = self.operators[1].next(mod_index, NO_MODULATOR);
                op3_out = self.operators[2].next(mod_index, op2_out * MODULATOR_MULTIPLIER);

                self.operators[3].next(mod_index, (op1_out + op3_out) * MODULATOR_MULTIPLIER)
            }

            4 => {
                // (FB)1 -> 2 -> 3 -> 4 -> OUT
                if self.operators[3].envelope_generator.stage == EnvelopeStage::Off {
                    return (0.0, 0.0);
                }

                op1_out = self.operators[0].next(mod_index, self.feedback_out1);
                let op2_out = self.operators[1].next(mod_index, op1_out * MODULATOR_MULTIPLIER);
                op3_out = self.operators[2].next(mod_index, op2_out * MODULATOR_MULTIPLIER);

                self.operators[3].next(mod_index, op3_out * MODULATOR_MULTIPLIER)
            }

            5 => {
                // (FB)1 -> 2 -> | -> OUT
                // (FB)3 -> 4 -> |
                if self.operators[1].envelope_generator.stage == EnvelopeStage::Off
                    && self.operators[3].envelope_generator.stage == EnvelopeStage::Off
                {
                    return (0.0, 0.0);
                }

                op1_out = self.operators[0].next(mod_index, self.feedback_out1);
                let op2_out = self.operators[1].next(mod_index, op1_out * MODULATOR_MULTIPLIER);

                op3_out = self.operators[2].next(mod_index, self.feedback_out3);
                let op4_out = self.operators[3].next(mod_index, op3_out * MODULATOR_MULTIPLIER);

                op2_out + op4_out
            }

            6 => {
                // (FB)1 -----------> | -> OUT
                //     2 -> 3 -> 4 -> |
                if self.operators[0].envelope_generator.stage == EnvelopeStage::Off
                    && self.operators[3].envelope_generator.stage == EnvelopeStage::Off
                {
                    return (0.0, 0.0);
                }

                op1_out = self.operators[0].next(mod_index, self.feedback_out1);
                let op2_out = self.operators[1].next(mod_index, NO_MODULATOR);
                op3_out = self.operators[2].next(mod_index, op2_out * MODULATOR_MULTIPLIER);
                let op4_out = self.operators[3].next(mod_index, op3_out * MODULATOR_MULTIPLIER);

                op1_out + op4_out
            }

            _ => {
                // (FB)1 ------> | -> OUT
                //     2 -> 3 -> |
                //     4 ------> |
                if self.operators[0].envelope_generator.stage == EnvelopeStage::Off
                    && self.operators[2].envelope_generator.stage == EnvelopeStage::Off
                    && self.operators[3].envelope_generator.stage == EnvelopeStage::Off
                {
                    return (0.0, 0.0);
                }

                op1_out = self.operators[0].next(mod_index, self.feedback_out1);
                let op2_out = self.operators[1].next(mod_index, NO_MODULATOR);
                op3_out = self.operators[2].next(mod_index, op2_out * MODULATOR_MULTIPLIER);
                let op4_out = self.operators[3].next(mod_index, NO_MODULATOR);

                op1_out + op3_out + op4_out
            }
        };

        if self.operators[0].feedback_coef != 0.0 {
            self.feedback1_prev = self.feedback1_curr;
            self.feedback1_curr = op1_out * self.operators[0].feedback_coef;
            self.feedback_out1 = self.feedback1_prev * self.feedback_blend_prev
                + self.feedback1_curr * self.feedback_blend_curr;
        }

        if self.operators[2].feedback_coef != 0.0 {
            self.feedback3_prev = self.feedback3_curr;
            self.feedback3_curr = op3_out * self.operators[2].feedback_coef;
            self.feedback_out3 = self.feedback3_prev * self.feedback_blend_prev
                + self.feedback3_curr * self.feedback_blend_curr;
        }

        let result = result * self.attenuation_coef;
        (result * self.pan_coef_l, result * self.pan_coef_r)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("channel_id", &self.channel_id)
            .field("midi_channel_id", &self.midi_channel_id)
            .field("alg", &self.alg)
            .field("kon", &self.kon)
            .field("fnum", &self.fnum)
            .field("block", &self.block)
            .field("bo", &self.bo)
            .field("level", &self.current_level())
            .field(
                "modulators",
                &[
                    self.operators[0].is_modulator,
                    self.operators[1].is_modulator,
                    self.operators[2].is_modulator,
                    self.operators[3].is_modulator,
                ],
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f64 = 44_100.0;

    fn sounding_channel(alg: i32) -> Channel {
        let mut ch = Channel::new(0, RATE);
        ch.set_alg(alg);
        for i in 0..4 {
            let op = ch.operator_mut(i);
            op.set_ar(15);
            op.set_sl(0);
            op.set_rr(15);
            op.set_mult(1);
        }
        ch.set_fnum(300);
        ch.set_block(4);
        ch.set_velocity(127);
        ch
    }

    #[test]
    fn test_idle_channel_returns_exact_zero() {
        for alg in 0..8 {
            let mut ch = sounding_channel(alg);
            for _ in 0..256 {
                assert_eq!(ch.next(), (0.0, 0.0));
            }
        }
    }

    #[test]
    fn test_keyed_channel_produces_audio() {
        for alg in 0..8 {
            let mut ch = sounding_channel(alg);
            ch.set_kon(1);
            let mut energy = 0.0;
            for _ in 0..1000 {
                let (l, r) = ch.next();
                energy += l * l + r * r;
            }
            assert!(energy > 0.0, "algorithm {alg} must sound when keyed");
        }
    }

    #[test]
    fn test_feedback_blend_coefficients_sum_to_one() {
        for rate in [22_050.0, 44_100.0, 48_000.0, 96_000.0] {
            let ch = Channel::new(0, rate);
            assert_eq!(ch.feedback_blend_prev + ch.feedback_blend_curr, 1.0);
            assert!(ch.feedback_blend_curr <= 1.0);
        }
        // At and below the reference rate the current sample dominates fully.
        assert_eq!(Channel::new(0, 48_000.0).feedback_blend_curr, 1.0);
    }

    #[test]
    fn test_algorithm_change_clears_feedback() {
        let mut ch = sounding_channel(0);
        ch.operator_mut(0).set_fb(5);
        ch.set_kon(1);
        for _ in 0..64 {
            ch.next();
        }
        assert!(ch.feedback1_curr != 0.0, "feedback line must be charged");

        ch.set_alg(4);
        assert_eq!(ch.feedback1_prev, 0.0);
        assert_eq!(ch.feedback1_curr, 0.0);
        assert_eq!(ch.feedback3_prev, 0.0);
        assert_eq!(ch.feedback3_curr, 0.0);
        assert_eq!(ch.feedback_out1, 0.0);
        assert_eq!(ch.feedback_out3, 0.0);
    }

    #[test]
    fn test_same_algorithm_keeps_phase_and_envelope() {
        let mut ch = sounding_channel(1);
        ch.set_kon(1);
        for _ in 0..64 {
            ch.next();
        }
        let level = ch.operators[0].envelope_generator.current_level;
        let stage = ch.operators[0].envelope_generator.stage;
        ch.set_alg(1);
        assert_eq!(ch.operators[0].envelope_generator.current_level, level);
        assert_eq!(ch.operators[0].envelope_generator.stage, stage);
    }

    #[test]
    fn test_key_on_is_idempotent() {
        let mut ch = sounding_channel(1);
        ch.set_kon(1);
        for _ in 0..64 {
            ch.next();
        }
        let level = ch.operators[0].envelope_generator.current_level;
        let stage = ch.operators[0].envelope_generator.stage;
        ch.set_kon(1);
        assert_eq!(ch.operators[0].envelope_generator.current_level, level);
        assert_eq!(ch.operators[0].envelope_generator.stage, stage);
    }

    #[test]
    fn test_pan_index_saturates() {
        let mut ch = Channel::new(0, RATE);
        // Hard left from the voice offset on top of a hard-left channel pan.
        ch.set_chpan(0);
        ch.set_panpot(0);
        assert_eq!(ch.pan_coef_l, PAN_TABLE[0][0]);
        assert_eq!(ch.pan_coef_r, PAN_TABLE[0][1]);
        // Hard right from both.
        ch.set_chpan(127);
        ch.set_panpot(31);
        assert_eq!(ch.pan_coef_l, PAN_TABLE[127][0]);
        assert_eq!(ch.pan_coef_r, PAN_TABLE[127][1]);
    }

    #[test]
    fn test_centre_pan_is_balanced() {
        let mut ch = sounding_channel(1);
        ch.set_kon(1);
        let mut l_energy = 0.0;
        let mut r_energy = 0.0;
        for _ in 0..2000 {
            let (l, r) = ch.next();
            l_energy += l * l;
            r_energy += r * r;
        }
        let diff = (l_energy - r_energy).abs() / l_energy.max(r_energy);
        assert!(diff < 0.01, "centred output must balance, diff {diff}");
    }

    #[test]
    fn test_final_key_off_resets_binding() {
        let mut ch = sounding_channel(1);
        ch.midi_channel_id = 3;
        ch.set_kon(1);
        for _ in 0..64 {
            ch.next();
        }
        ch.set_kon(0);
        // RR=15 releases within a few milliseconds.
        for _ in 0..2048 {
            ch.next();
        }
        assert!(ch.is_off());
        // The binding clears on the next key-off once everything is silent.
        ch.set_kon(0);
        assert_eq!(ch.midi_channel_id, -1);
        assert_eq!(ch.kon, 0);
    }

    #[test]
    fn test_attenuation_tracks_volume() {
        let mut loud = sounding_channel(1);
        let mut quiet = sounding_channel(1);
        quiet.set_volume(0);
        loud.set_kon(1);
        quiet.set_kon(1);
        let mut loud_energy = 0.0;
        let mut quiet_energy = 0.0;
        for _ in 0..1000 {
            let (l, _) = loud.next();
            loud_energy += l * l;
            let (l, _) = quiet.next();
            quiet_energy += l * l;
        }
        assert!(quiet_energy < loud_energy);
    }

    #[test]
    fn test_vibrato_changes_output() {
        let mut plain = sounding_channel(1);
        let mut wobbly = sounding_channel(1);
        wobbly.set_lfo(5);
        wobbly.operator_mut(0).set_evb(true);
        wobbly.operator_mut(0).set_dvb(3);
        wobbly.operator_mut(1).set_evb(true);
        wobbly.operator_mut(1).set_dvb(3);
        plain.set_kon(1);
        wobbly.set_kon(1);
        let mut diverged = false;
        for _ in 0..(RATE as usize / 4) {
            let (a, _) = plain.next();
            let (b, _) = wobbly.next();
            if (a - b).abs() > 1e-6 {
                diverged = true;
                break;
            }
        }
        assert!(diverged, "vibrato must modulate the phase");
    }
}
