//! End-to-end synthesis checks through the public chip and controller APIs.

use ma5::{
    ChannelReg, Chip, Controller, FmVoice, OpReg, OperatorPatch, Registers, VoiceLibrary,
    VoiceProgram, VoiceType,
};
use rustfft::{num_complex::Complex, FftPlanner};

const SAMPLE_RATE: f64 = 44_100.0;

/// Render `count` stereo frames from a chip.
fn render(chip: &mut Chip, count: usize) -> (Vec<f64>, Vec<f64>) {
    let mut left = Vec::with_capacity(count);
    let mut right = Vec::with_capacity(count);
    for _ in 0..count {
        let (l, r) = chip.next();
        left.push(l);
        right.push(r);
    }
    (left, right)
}

fn rms(samples: &[f64]) -> f64 {
    (samples.iter().map(|s| s * s).sum::<f64>() / samples.len() as f64).sqrt()
}

/// Frequency of the strongest magnitude bin, in Hz.
fn spectral_peak_hz(samples: &[f64]) -> f64 {
    let n = samples.len();
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    let mut buffer: Vec<Complex<f64>> =
        samples.iter().map(|&s| Complex::new(s, 0.0)).collect();
    fft.process(&mut buffer);

    let mut peak_bin = 1;
    let mut peak_mag = 0.0;
    for (bin, value) in buffer.iter().enumerate().take(n / 2).skip(1) {
        let mag = value.norm_sqr();
        if mag > peak_mag {
            peak_mag = mag;
            peak_bin = bin;
        }
    }
    peak_bin as f64 * SAMPLE_RATE / n as f64
}

fn organ_patch(tl: u8) -> OperatorPatch {
    OperatorPatch {
        ar: 15,
        sl: 0,
        rr: 12,
        tl,
        mult: 1,
        ..Default::default()
    }
}

fn organ_program() -> VoiceProgram {
    VoiceProgram {
        voice_type: VoiceType::Fm,
        fm: FmVoice {
            alg: 1,
            panpot: 15,
            bo: 1,
            operators: [organ_patch(0), organ_patch(0x3f), organ_patch(0x3f), organ_patch(0x3f)],
            ..Default::default()
        },
        ..Default::default()
    }
}

fn organ_controller() -> Controller<Chip> {
    Controller::new(
        Chip::new(),
        vec![VoiceLibrary::new(vec![organ_program()])],
    )
}

#[test]
fn silent_by_default() {
    let mut chip = Chip::with_rate(SAMPLE_RATE, 16).unwrap();
    for _ in 0..1024 {
        assert_eq!(chip.next(), (0.0, 0.0));
    }
}

#[test]
fn single_sine_note_peaks_at_440hz() {
    let mut chip = Chip::with_rate(SAMPLE_RATE, 16).unwrap();

    chip.write_channel(0, ChannelReg::Alg, 1);
    for op in 0..4 {
        chip.write_operator(0, op, OpReg::Ws, 0);
        chip.write_operator(0, op, OpReg::Ar, 15);
        chip.write_operator(0, op, OpReg::Dr, 0);
        chip.write_operator(0, op, OpReg::Sl, 0);
        chip.write_operator(0, op, OpReg::Sr, 0);
        chip.write_operator(0, op, OpReg::Rr, 15);
        chip.write_operator(0, op, OpReg::Mult, 1);
        chip.write_operator(0, op, OpReg::Tl, if op == 0 { 0 } else { 0x3f });
    }
    // A4 at block 4: fnum = 440 Hz * FNUM_COEF >> 3.
    chip.write_channel(0, ChannelReg::Fnum, 300);
    chip.write_channel(0, ChannelReg::Block, 4);
    chip.write_channel(0, ChannelReg::Volume, 127);
    chip.write_channel(0, ChannelReg::Expression, 127);
    chip.write_channel(0, ChannelReg::Velocity, 127);
    chip.write_channel(0, ChannelReg::Kon, 1);

    let (left, right) = render(&mut chip, SAMPLE_RATE as usize);

    let peak = spectral_peak_hz(&left);
    assert!((peak - 440.0).abs() <= 1.0, "peak at {peak} Hz");

    let left_rms = rms(&left);
    let right_rms = rms(&right);
    assert!(left_rms > 0.1, "left RMS {left_rms}");
    let balance = (left_rms - right_rms).abs() / left_rms.max(right_rms);
    assert!(balance < 0.01, "L/R imbalance {balance}");
}

#[test]
fn controller_note_renders_the_played_pitch() {
    let mut controller = organ_controller();
    controller.note_on(0, 69, 127);
    let (left, _) = render(controller.registers_mut(), SAMPLE_RATE as usize);

    assert!(rms(&left) > 0.005, "note must be audible");
    let peak = spectral_peak_hz(&left);
    assert!((peak - 440.0).abs() <= 2.0, "A4 expected, peak at {peak} Hz");
}

#[test]
fn note_off_decays_to_exact_silence() {
    let mut controller = organ_controller();
    controller.note_on(0, 60, 100);
    let (audible, _) = render(controller.registers_mut(), 4410);
    assert!(rms(&audible) > 0.0);

    controller.note_off(0, 60);
    render(controller.registers_mut(), SAMPLE_RATE as usize / 2);
    for _ in 0..256 {
        assert_eq!(controller.registers_mut().next(), (0.0, 0.0));
    }
}

#[test]
fn sustain_pedal_holds_the_note() {
    let mut controller = organ_controller();
    controller.control_change(0, 64, 0x7f);
    controller.note_on(0, 60, 100);
    controller.note_off(0, 60);

    // The pedal keeps the note sounding long past its release time.
    render(controller.registers_mut(), SAMPLE_RATE as usize / 2);
    let (held, _) = render(controller.registers_mut(), 4410);
    assert!(rms(&held) > 0.0, "sustained note went silent");

    controller.control_change(0, 64, 0);
    render(controller.registers_mut(), SAMPLE_RATE as usize / 2);
    for _ in 0..256 {
        assert_eq!(controller.registers_mut().next(), (0.0, 0.0));
    }
}

#[test]
fn reset_silences_immediately() {
    let mut controller = organ_controller();
    controller.note_on(0, 69, 127);
    render(controller.registers_mut(), 1024);

    controller.reset();
    for _ in 0..1024 {
        assert_eq!(controller.registers_mut().next(), (0.0, 0.0));
    }
}

#[test]
fn seventeenth_note_steals_and_still_renders() {
    let mut controller = organ_controller();
    for note in 0..16 {
        controller.note_on(0, 48 + note, 100);
    }
    controller.note_on(0, 96, 100);

    let (left, _) = render(controller.registers_mut(), 8820);
    assert!(rms(&left) > 0.0);
}

#[test]
fn pitch_bend_moves_the_spectral_peak() {
    let mut controller = organ_controller();
    controller.note_on(0, 69, 127);
    // Maximum upward bend at the default 200-cent sensitivity lands just
    // under a whole tone above A4.
    controller.pitch_bend(0, 0x7f, 0x7f);
    let (left, _) = render(controller.registers_mut(), SAMPLE_RATE as usize);
    let peak = spectral_peak_hz(&left);
    let expected = 440.0 * 2f64.powf(1.96875 / 12.0);
    assert!(
        (peak - expected).abs() <= 4.0,
        "expected ~{expected:.1} Hz, peak at {peak} Hz"
    );
}
