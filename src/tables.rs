//! Shared read-only tables for the synthesis core.
//!
//! Everything in this module is immutable after construction and may be read
//! from any number of concurrently-live chip instances without
//! synchronization. Computed tables are `LazyLock` statics built on first
//! use; tables with hardware-given values are `const` arrays.

use std::sync::LazyLock;

/// Number of synthesis channels on an MA-5 class chip.
pub const CHANNEL_COUNT: usize = 16;

/// Number of MIDI channels tracked by the controller.
pub const MIDI_CHANNEL_COUNT: usize = 16;

/// Sample rate the original silicon was clocked for, in Hz.
///
/// The feedback path blends its one-sample delay line against this rate so
/// that chips running at higher host rates keep an equivalent perceived
/// feedback bandwidth.
pub const REFERENCE_SAMPLE_RATE: f64 = 48_000.0;

/// Scale factor between a frequency in Hz and the fnum encoding.
///
/// The chip interprets `freq_hz = fnum * 2^(block + bo - 2) / FNUM_COEF`; the
/// controller inverts this as `fnum = freq_hz * FNUM_COEF >> (block - 1)` at
/// the default block offset of 1.
pub const FNUM_COEF: f64 = (1u64 << 19) as f64 / REFERENCE_SAMPLE_RATE / 2.0;

/// Real-note value of A3 in the controller's note space.
pub const A3_NOTE: i32 = 47;

/// Frequency of A3 in Hz.
pub const A3_FREQ: f64 = 220.0;

/// 64-bit fixed-point phase. One full waveform cycle spans the whole `u64`
/// range, so wrapping addition is the natural cycle modulo.
pub type Frac64 = u64;

const WAVEFORM_BITS: u32 = 10;

/// Length of each waveform table.
pub const WAVEFORM_LEN: usize = 1 << WAVEFORM_BITS;

/// Bits to shift a [`Frac64`] down to a waveform table index.
pub const WAVEFORM_INDEX_SHIFT: u32 = 64 - WAVEFORM_BITS;

const MOD_TABLE_BITS: u32 = 10;

/// Length of the tremolo/vibrato modulation tables.
pub const MOD_TABLE_LEN: usize = 1 << MOD_TABLE_BITS;

/// Bits to shift the LFO phase down to a modulation table index.
pub const MOD_INDEX_SHIFT: u32 = 64 - MOD_TABLE_BITS;

const FRAC64_ONE: f64 = 18_446_744_073_709_551_616.0; // 2^64

/// Convert a value in waveform cycles into a wrapped [`Frac64`] phase offset.
///
/// Only the fractional cycle survives, so negative inputs wrap the same way
/// the phase accumulator itself does.
#[inline]
pub fn frac64_from_float(v: f64) -> Frac64 {
    ((v - v.floor()) * FRAC64_ONE) as u64
}

/// Scalar applied to every inter-operator modulation input.
pub const MODULATOR_MULTIPLIER: f64 = 2.0;

/// Self-feedback gain per FB register value; index 0 disables the path.
pub const FEEDBACK_TABLE: [f64; 8] = [0.0, 0.0625, 0.125, 0.25, 0.5, 1.0, 2.0, 4.0];

/// Frequency multiplier per MULT register value.
pub const MULT_TABLE: [f64; 16] = [
    0.5, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 10.0, 12.0, 12.0, 15.0, 15.0,
];

/// Detune in cents per DT register value; 4..=7 detune downward.
const DT_CENTS: [f64; 8] = [0.0, 1.4, 2.8, 5.6, 0.0, -1.4, -2.8, -5.6];

/// Detune as a frequency ratio per DT register value.
pub static DT_MULTIPLIER: LazyLock<[f64; 8]> =
    LazyLock::new(|| std::array::from_fn(|i| (DT_CENTS[i] / 1200.0).exp2()));

/// Operators mixed straight into the channel output, per algorithm.
///
/// ```text
/// ALG 0  (FB)1 -> 2 -> OUT
/// ALG 1  (FB)1 / 2 -> OUT
/// ALG 2  (FB)1 / 2 / (FB)3 / 4 -> OUT
/// ALG 3  (FB)1 -> 4, 2 -> 3 -> 4 -> OUT
/// ALG 4  (FB)1 -> 2 -> 3 -> 4 -> OUT
/// ALG 5  (FB)1 -> 2 / (FB)3 -> 4 -> OUT
/// ALG 6  (FB)1 / 2 -> 3 -> 4 -> OUT
/// ALG 7  (FB)1 / 2 -> 3 / 4 -> OUT
/// ```
pub const CARRIER_MATRIX: [[bool; 4]; 8] = [
    [false, true, false, false],
    [true, true, false, false],
    [true, true, true, true],
    [false, false, false, true],
    [false, false, false, true],
    [false, true, false, true],
    [true, false, false, true],
    [true, false, true, true],
];

/// Operators whose output feeds another operator's phase, per algorithm.
pub const MODULATOR_MATRIX: [[bool; 4]; 8] = [
    [true, false, false, false],
    [false, false, false, false],
    [false, false, false, false],
    [true, true, true, false],
    [true, true, true, false],
    [true, false, true, false],
    [false, true, true, false],
    [false, true, false, false],
];

/// The eight waveform shapes, one cycle of [`WAVEFORM_LEN`] samples each.
///
/// 0 sine, 1 half sine, 2 absolute sine, 3 quarter (pulse) sine, 4 even
/// sine, 5 even absolute sine, 6 square, 7 sawtooth.
pub static WAVEFORMS: LazyLock<[[f64; WAVEFORM_LEN]; 8]> = LazyLock::new(|| {
    use std::f64::consts::TAU;
    let mut tables = [[0.0; WAVEFORM_LEN]; 8];
    for i in 0..WAVEFORM_LEN {
        let theta = TAU * i as f64 / WAVEFORM_LEN as f64;
        let sin = theta.sin();
        let first_half = i < WAVEFORM_LEN / 2;
        let odd_quarter = (i / (WAVEFORM_LEN / 4)) % 2 == 0;
        tables[0][i] = sin;
        tables[1][i] = sin.max(0.0);
        tables[2][i] = sin.abs();
        tables[3][i] = if odd_quarter { sin.abs() } else { 0.0 };
        tables[4][i] = if first_half { (2.0 * theta).sin() } else { 0.0 };
        tables[5][i] = if first_half { (2.0 * theta).sin().abs() } else { 0.0 };
        tables[6][i] = if first_half { 1.0 } else { -1.0 };
        tables[7][i] = 1.0 - 2.0 * i as f64 / WAVEFORM_LEN as f64;
    }
    tables
});

/// Equal-power pan coefficients `[left, right]`, indexed 0..=127.
///
/// Index 64 sits exactly on the power centre so a centred channel plays both
/// sides at identical gain.
pub static PAN_TABLE: LazyLock<[[f64; 2]; 128]> = LazyLock::new(|| {
    use std::f64::consts::FRAC_PI_2;
    std::array::from_fn(|i| {
        let theta = FRAC_PI_2 * i as f64 / 128.0;
        [theta.cos(), theta.sin()]
    })
});

/// Channel attenuation per `midi_value >> 2` step, 0.75 dB per step up to
/// unity at index 31.
///
/// Index 0 is quiet but not silent: the controller expresses note velocity
/// through operator total levels and leaves the chip's VELOCITY register at
/// its reset value, so a hard zero here would mute controller-driven
/// playback entirely.
pub static VOLUME_TABLE: LazyLock<[f64; 32]> =
    LazyLock::new(|| std::array::from_fn(|i| 10f64.powf(-0.75 * (31 - i) as f64 / 20.0)));

/// MIDI velocity curve applied to carrier total levels.
pub const VELOCITY_TABLE: [u8; 128] = [
    0, 1, 3, 5, 6, 8, 10, 11, //
    13, 14, 16, 17, 19, 20, 22, 23, //
    25, 26, 27, 29, 30, 32, 33, 34, //
    36, 37, 39, 41, 43, 45, 47, 49, //
    50, 52, 54, 55, 57, 59, 60, 61, //
    63, 64, 66, 67, 68, 69, 71, 72, //
    73, 74, 75, 76, 77, 79, 80, 81, //
    82, 83, 84, 84, 85, 86, 87, 88, //
    89, 90, 91, 92, 92, 93, 94, 95, //
    96, 96, 97, 98, 99, 99, 100, 101, //
    101, 102, 103, 103, 104, 105, 105, 106, //
    107, 107, 108, 109, 109, 110, 110, 111, //
    112, 112, 113, 113, 114, 114, 115, 115, //
    116, 117, 117, 118, 118, 119, 119, 120, //
    120, 121, 121, 122, 122, 123, 123, 123, //
    124, 124, 125, 125, 126, 126, 127, 127, //
];

/// Key-scale-level base attenuation in dB, indexed by the fnum top nibble.
const KSL_BASE_DB: [f64; 16] = [
    0.0, 9.0, 12.0, 13.875, 15.0, 16.125, 16.875, 17.625, 18.0, 18.75, 19.125, 19.5, 19.875,
    20.25, 20.625, 21.0,
];

/// Key-scale-level attenuation in dB for the given register state.
///
/// KSL 0 disables scaling; 1 and 2 halve and quarter the 6 dB/octave base
/// slope, 3 applies it in full.
pub fn ksl_attenuation_db(ksl: u8, block: i32, fnum: i32) -> f64 {
    if ksl == 0 {
        return 0.0;
    }
    let base = KSL_BASE_DB[((fnum >> 6) & 0x0f) as usize] + 6.0 * block as f64 - 48.0;
    let base = base.max(0.0);
    match ksl & 3 {
        1 => base * 0.5,
        2 => base * 0.25,
        _ => base,
    }
}

/// Linear gain for a total-level register value, 0.75 dB per step.
#[inline]
pub fn total_level_coef(tl: u8) -> f64 {
    10f64.powf(-0.75 * (tl & 0x3f) as f64 / 20.0)
}

/// Attack time in seconds at key-scale factor 1, per AR value.
///
/// AR 0 never attacks and AR 15 is instantaneous.
pub static ATTACK_SECONDS: LazyLock<[f64; 16]> = LazyLock::new(|| {
    std::array::from_fn(|r| match r {
        0 => f64::INFINITY,
        15 => 0.0,
        r => 2.826 / (1u32 << (r - 1)) as f64,
    })
});

/// Decay speed in dB per second at key-scale factor 1, per DR/SR/RR value.
///
/// Rate 0 holds the level.
pub static DECAY_DB_PER_SEC: LazyLock<[f64; 16]> =
    LazyLock::new(|| std::array::from_fn(|r| if r == 0 { 0.0 } else { 0.3 * (1u32 << r) as f64 }));

/// Decay speed used to silence a sounding operator before re-keying it.
pub const DAMP_DB_PER_SEC: f64 = 48_000.0;

/// Rate key-scaling factor derived from block and fnum.
///
/// The keycode doubles the envelope rates every four steps; without KSR the
/// keycode is coarsened to block pairs.
pub fn rate_scale(block: i32, fnum: i32, ksr: bool) -> f64 {
    let keycode = ((block & 7) << 1) | ((fnum >> 9) & 1);
    let rof = if ksr { keycode } else { keycode >> 2 };
    (rof as f64 / 4.0).exp2()
}

/// LFO frequency in Hz per LFO register value.
pub const LFO_HZ: [f64; 8] = [3.98, 5.56, 6.02, 6.37, 6.88, 9.63, 48.1, 72.2];

const DAM_DEPTH_DB: [f64; 4] = [1.3, 2.8, 5.9, 11.8];
const DVB_DEPTH_CENTS: [f64; 4] = [3.4, 6.7, 13.4, 26.8];

/// Tremolo attenuation factor over one LFO cycle, per DAM depth.
pub static TREMOLO_COEF: LazyLock<[[f64; MOD_TABLE_LEN]; 4]> = LazyLock::new(|| {
    use std::f64::consts::TAU;
    std::array::from_fn(|dam| {
        std::array::from_fn(|i| {
            let x = 0.5 - 0.5 * (TAU * i as f64 / MOD_TABLE_LEN as f64).cos();
            10f64.powf(-DAM_DEPTH_DB[dam] * x / 20.0)
        })
    })
});

/// Signed vibrato offset over one LFO cycle, as a fraction of the phase
/// increment, per DVB depth.
pub static VIBRATO_RATIO: LazyLock<[[f64; MOD_TABLE_LEN]; 4]> = LazyLock::new(|| {
    use std::f64::consts::TAU;
    std::array::from_fn(|dvb| {
        std::array::from_fn(|i| {
            let s = (TAU * i as f64 / MOD_TABLE_LEN as f64).sin();
            (DVB_DEPTH_CENTS[dvb] * s / 1200.0).exp2() - 1.0
        })
    })
});
