//! MIDI-level voice controller.
//!
//! The controller translates MIDI-like events into writes on a [`Registers`]
//! sink. It keeps one state record per MIDI channel and a slot table with one
//! entry per synthesis channel; a slot binds a channel to a live note until
//! it is released, stolen or reset. All register writes for a note land
//! before its final KON write, so attack always begins on a fully-configured
//! voice.

use crate::registers::{ChannelReg, OpReg, Registers};
use crate::tables::{A3_FREQ, A3_NOTE, CHANNEL_COUNT, FNUM_COEF, MIDI_CHANNEL_COUNT, VELOCITY_TABLE};
use crate::voice::{VoiceLibrary, VoiceProgram, VoiceType};

const FLAG_SUSTAIN: u8 = 0x02;
const FLAG_VIBRATO: u8 = 0x04;
const FLAG_FREE: u8 = 0x80;

/// Modulation depth at or above which vibrato is forced on.
const MOD_THRESH: i32 = 40;

const CC_BANK_MSB: i32 = 0;
const CC_MODULATION: i32 = 1;
const CC_DATA_ENTRY_HI: i32 = 6;
const CC_VOLUME: i32 = 7;
const CC_PAN: i32 = 10;
const CC_EXPRESSION: i32 = 11;
const CC_BANK_LSB: i32 = 32;
const CC_DATA_ENTRY_LO: i32 = 38;
const CC_SUSTAIN_PEDAL: i32 = 64;
const CC_NRPN_LO: i32 = 98;
const CC_NRPN_HI: i32 = 99;
const CC_RPN_LO: i32 = 100;
const CC_RPN_HI: i32 = 101;
const CC_SOUNDS_OFF: i32 = 120;
const CC_NOTES_OFF: i32 = 123;

/// A synthesis channel's binding to a live MIDI note.
#[derive(Debug, Clone, Default)]
struct Slot {
    midi_channel: i32,
    note: i32,
    realnote: i32,
    flags: u8,
    finetune: i32,
    pitch: i32,
    #[allow(dead_code)]
    velocity: i32,
    instrument: Option<VoiceProgram>,
    touched: u64,
}

/// Controller state for one MIDI channel.
#[derive(Debug, Clone, Default)]
struct MidiChannelState {
    bank_msb: u8,
    bank_lsb: u8,
    program: u8,
    volume: u8,
    expression: u8,
    pan: u8,
    pitch: i8,
    sustain: u8,
    modulation: u8,
    pitch_sens: u16,
    rpn: u16,
}

/// Map a total-level register value through the MIDI velocity curve.
///
/// Velocity 0 forces full attenuation (0x3f); higher velocities approach the
/// programmed level.
pub fn convert_velocity(tl: i32, velocity: i32) -> i32 {
    let r = i32::from(VELOCITY_TABLE[(velocity & 0x7f) as usize]);
    0x3f - ((0x3f - tl) * r >> 7)
}

/// MIDI-level controller for an MA-5 register sink.
///
/// # Example
///
/// ```
/// use ma5::{Chip, Controller, VoiceLibrary};
///
/// let library = VoiceLibrary::new(vec![Default::default()]);
/// let mut controller = Controller::new(Chip::new(), vec![library]);
/// controller.note_on(0, 69, 100);
/// let (left, right) = controller.registers_mut().next();
/// # let _ = (left, right);
/// ```
#[derive(Debug)]
pub struct Controller<R: Registers> {
    registers: R,
    libraries: Vec<VoiceLibrary>,
    midi_channel_states: [MidiChannelState; MIDI_CHANNEL_COUNT],
    slots: Vec<Slot>,
    clock: u64,
}

impl<R: Registers> Controller<R> {
    /// Create a controller over a register sink and a voice library list.
    ///
    /// The controller starts reset: all slots free, MIDI defaults restored
    /// and the chip silenced.
    pub fn new(registers: R, libraries: Vec<VoiceLibrary>) -> Self {
        let mut controller = Self {
            registers,
            libraries,
            midi_channel_states: std::array::from_fn(|_| MidiChannelState::default()),
            slots: vec![Slot::default(); CHANNEL_COUNT],
            clock: 0,
        };
        controller.reset();
        controller
    }

    /// Borrow the underlying register sink.
    pub fn registers(&self) -> &R {
        &self.registers
    }

    /// Mutably borrow the underlying register sink, e.g. to pull samples
    /// from a [`Chip`](crate::Chip).
    pub fn registers_mut(&mut self) -> &mut R {
        &mut self.registers
    }

    /// Consume the controller and return the register sink.
    pub fn into_registers(self) -> R {
        self.registers
    }

    /// Handle a MIDI note-on. Velocity 0 is a note-off.
    pub fn note_on(&mut self, midi_channel: usize, note: i32, velocity: i32) {
        let midi_channel = midi_channel & 0x0f;
        if velocity == 0 {
            self.note_off(midi_channel, note);
            return;
        }

        let Some((instrument, found)) = self.instrument_for(midi_channel, note) else {
            return;
        };
        if !found {
            log::warn!(
                "voice not found: @{}-{}-{} note={}",
                instrument.bank_msb,
                instrument.bank_lsb,
                instrument.program,
                note
            );
            return;
        }
        if instrument.voice_type != VoiceType::Fm {
            log::warn!(
                "unsupported voice type: @{}-{}-{} note={} type={:?}",
                instrument.bank_msb,
                instrument.bank_lsb,
                instrument.program,
                note,
                instrument.voice_type
            );
            return;
        }

        if let Some(slot_id) = self.find_free_slot() {
            self.occupy_slot(slot_id, midi_channel, note, velocity, instrument);
        }
    }

    /// Handle a MIDI note-off. With the sustain pedal down the release is
    /// deferred until the pedal lifts.
    pub fn note_off(&mut self, midi_channel: usize, note: i32) {
        let midi_channel = midi_channel & 0x0f;
        let sustain = self.midi_channel_states[midi_channel].sustain;
        for i in 0..self.slots.len() {
            if self.slots[i].midi_channel == midi_channel as i32 && self.slots[i].note == note {
                if sustain < 0x40 {
                    self.release_slot(i, false);
                } else {
                    self.slots[i].flags |= FLAG_SUSTAIN;
                }
            }
        }
    }

    /// Handle a MIDI control change.
    pub fn control_change(&mut self, midi_channel: usize, cc: i32, value: i32) {
        let midi_channel = midi_channel & 0x0f;
        match cc {
            CC_BANK_MSB => self.midi_channel_states[midi_channel].bank_msb = value as u8,
            CC_BANK_LSB => self.midi_channel_states[midi_channel].bank_lsb = value as u8,

            CC_MODULATION => {
                self.midi_channel_states[midi_channel].modulation = value as u8;
                self.clock += 1;
                let clock = self.clock;
                for i in 0..self.slots.len() {
                    if self.slots[i].midi_channel != midi_channel as i32 {
                        continue;
                    }
                    let flags = self.slots[i].flags;
                    self.slots[i].touched = clock;
                    let vibrato = MOD_THRESH <= value;
                    if vibrato {
                        self.slots[i].flags |= FLAG_VIBRATO;
                    } else {
                        self.slots[i].flags &= !FLAG_VIBRATO;
                    }
                    if self.slots[i].flags != flags {
                        if let Some(instrument) = self.slots[i].instrument.clone() {
                            self.write_modulation(i, &instrument, vibrato);
                        }
                    }
                }
            }

            CC_VOLUME => {
                self.midi_channel_states[midi_channel].volume = value as u8;
                self.mirror_channel_write(midi_channel, ChannelReg::Volume, value);
            }

            CC_EXPRESSION => {
                self.midi_channel_states[midi_channel].expression = value as u8;
                self.mirror_channel_write(midi_channel, ChannelReg::Expression, value);
            }

            CC_PAN => {
                self.midi_channel_states[midi_channel].pan = value as u8;
                self.mirror_channel_write(midi_channel, ChannelReg::Chpan, value);
            }

            CC_SUSTAIN_PEDAL => {
                self.midi_channel_states[midi_channel].sustain = value as u8;
                if value < 0x40 {
                    self.release_sustain(midi_channel);
                }
            }

            CC_NOTES_OFF => {
                let sustain = self.midi_channel_states[midi_channel].sustain;
                for i in 0..self.slots.len() {
                    if self.slots[i].midi_channel != midi_channel as i32 {
                        continue;
                    }
                    if sustain < 0x40 {
                        self.release_slot(i, false);
                    } else {
                        self.slots[i].flags |= FLAG_SUSTAIN;
                    }
                }
            }

            CC_SOUNDS_OFF => {
                for i in 0..self.slots.len() {
                    if self.slots[i].midi_channel == midi_channel as i32 {
                        self.release_slot(i, false);
                    }
                }
            }

            CC_RPN_HI => {
                let state = &mut self.midi_channel_states[midi_channel];
                state.rpn = (state.rpn & 0x007f) | ((value as u16) << 7);
            }

            CC_RPN_LO => {
                let state = &mut self.midi_channel_states[midi_channel];
                state.rpn = (state.rpn & 0x3f80) | value as u16;
            }

            CC_NRPN_LO | CC_NRPN_HI => {
                self.midi_channel_states[midi_channel].rpn = 0x3fff;
            }

            CC_DATA_ENTRY_HI => {
                let state = &mut self.midi_channel_states[midi_channel];
                if state.rpn == 0 {
                    state.pitch_sens = (value & 0x7f) as u16 * 100 + state.pitch_sens % 100;
                }
            }

            CC_DATA_ENTRY_LO => {
                let state = &mut self.midi_channel_states[midi_channel];
                if state.rpn == 0 {
                    state.pitch_sens = (value & 0x7f) as u16 + state.pitch_sens / 100 * 100;
                }
            }

            _ => {}
        }
    }

    /// Handle a MIDI program change.
    pub fn program_change(&mut self, midi_channel: usize, program: i32) {
        self.midi_channel_states[midi_channel & 0x0f].program = program as u8;
    }

    /// Handle a MIDI pitch bend from its 7-bit low/high value bytes.
    ///
    /// The wheel value is centred on 8192 and scaled by the channel's
    /// pitch-bend sensitivity into the `(pitch - 64) / 32` semitone
    /// convention used by the frequency writer.
    pub fn pitch_bend(&mut self, midi_channel: usize, low: i32, high: i32) {
        let midi_channel = midi_channel & 0x0f;
        let raw = (high & 0x7f) * 128 + (low & 0x7f) - 8192;
        let sens = f64::from(self.midi_channel_states[midi_channel].pitch_sens);
        let pitch = (f64::from(raw) * sens / (200.0 * 128.0) + 64.0) as i32;
        self.midi_channel_states[midi_channel].pitch = pitch as i8;
        self.clock += 1;
        let clock = self.clock;
        for i in 0..self.slots.len() {
            if self.slots[i].midi_channel != midi_channel as i32 {
                continue;
            }
            self.slots[i].touched = clock;
            self.slots[i].pitch = self.slots[i].finetune + pitch;
            let (realnote, slot_pitch) = (self.slots[i].realnote, self.slots[i].pitch);
            self.write_frequency(i, realnote, slot_pitch, true);
        }
    }

    /// Reset the controller: clear every slot, restore MIDI channel defaults
    /// and silence the chip.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.midi_channel = -1;
            slot.note = 0;
            slot.flags = 0;
            slot.realnote = 0;
            slot.finetune = 0;
            slot.pitch = 0;
            slot.velocity = 0;
            slot.instrument = None;
            slot.touched = 0;
        }
        for state in &mut self.midi_channel_states {
            state.volume = 100;
            state.pan = 64;
        }
        self.shutup();
        self.release_all_slots();
        self.reset_all_midi_channels();
    }

    fn mirror_channel_write(&mut self, midi_channel: usize, reg: ChannelReg, value: i32) {
        self.clock += 1;
        let clock = self.clock;
        for i in 0..self.slots.len() {
            if self.slots[i].midi_channel == midi_channel as i32 {
                self.slots[i].touched = clock;
                self.registers.write_channel(i, reg, value);
            }
        }
    }

    fn write_modulation(&mut self, slot_id: usize, instrument: &VoiceProgram, vibrato: bool) {
        for (i, op) in instrument.fm.operators.iter().enumerate() {
            self.registers
                .write_operator(slot_id, i, OpReg::Evb, i32::from(op.evb || vibrato));
        }
    }

    fn occupy_slot(
        &mut self,
        slot_id: usize,
        midi_channel: usize,
        note: i32,
        velocity: i32,
        instrument: VoiceProgram,
    ) {
        self.clock += 1;
        let state = &self.midi_channel_states[midi_channel];
        let state_pitch = i32::from(state.pitch);
        let modulation = i32::from(state.modulation);
        let pan = i32::from(state.pan);
        let volume = i32::from(state.volume);
        let expression = i32::from(state.expression);

        let mut note = note;
        let slot = &mut self.slots[slot_id];
        slot.midi_channel = midi_channel as i32;
        slot.note = note;
        slot.flags = 0;
        if MOD_THRESH <= modulation {
            slot.flags |= FLAG_VIBRATO;
        }
        slot.touched = self.clock;
        slot.velocity = velocity;
        slot.finetune = 0;
        if instrument.drum_note != 0 {
            note = i32::from(instrument.fm.drum_key);
        }
        slot.pitch = slot.finetune + state_pitch;
        note += 2 - 12;
        slot.realnote = note;
        let vibrato = slot.flags & FLAG_VIBRATO != 0;
        let pitch = slot.pitch;
        slot.instrument = Some(instrument.clone());

        self.write_instrument(slot_id, &instrument);
        self.write_modulation(slot_id, &instrument, vibrato);
        self.registers.write_channel(slot_id, ChannelReg::Chpan, pan);
        self.registers
            .write_channel(slot_id, ChannelReg::Volume, volume);
        self.registers
            .write_channel(slot_id, ChannelReg::Expression, expression);
        self.write_velocity(slot_id, velocity, &instrument);
        self.write_frequency(slot_id, note, pitch, true);
    }

    fn release_slot(&mut self, slot_id: usize, killed: bool) {
        self.clock += 1;
        let (realnote, pitch) = {
            let slot = &self.slots[slot_id];
            (slot.realnote, slot.pitch)
        };
        self.write_frequency(slot_id, realnote, pitch, false);
        let slot = &mut self.slots[slot_id];
        slot.midi_channel = -1;
        slot.touched = self.clock;
        slot.flags = FLAG_FREE;
        if killed {
            self.write_all_ops(slot_id, OpReg::Sl, 0);
            self.write_all_ops(slot_id, OpReg::Rr, 15); // fastest release
            self.write_all_ops(slot_id, OpReg::Ksl, 0);
            self.write_all_ops(slot_id, OpReg::Tl, 0x3f); // no volume
        }
    }

    fn release_sustain(&mut self, midi_channel: usize) {
        for i in 0..self.slots.len() {
            if self.slots[i].midi_channel == midi_channel as i32
                && self.slots[i].flags & FLAG_SUSTAIN != 0
            {
                self.release_slot(i, false);
            }
        }
    }

    /// Find a slot for a new note: any free slot, else steal the least
    /// recently touched one after a kill release.
    fn find_free_slot(&mut self) -> Option<usize> {
        for i in 0..self.slots.len() {
            if self.slots[i].flags & FLAG_FREE != 0 {
                return Some(i);
            }
        }

        let mut oldest = None;
        let mut oldest_touched = u64::MAX;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.touched < oldest_touched {
                oldest_touched = slot.touched;
                oldest = Some(i);
            }
        }

        if let Some(slot_id) = oldest {
            self.release_slot(slot_id, true);
        }
        oldest
    }

    /// Look up the instrument for a note, retrying the fallback program of
    /// bank 125 and finally handing back the first program of the first
    /// library with `found = false`. `None` only when no library has any
    /// program at all.
    fn instrument_for(&mut self, midi_channel: usize, note: i32) -> Option<(VoiceProgram, bool)> {
        loop {
            let state = &self.midi_channel_states[midi_channel];
            for library in &self.libraries {
                for program in &library.programs {
                    if program.program != state.program
                        || program.bank_lsb != state.bank_lsb
                        || program.bank_msb != state.bank_msb
                    {
                        continue;
                    }
                    if program.drum_note != 0 && i32::from(program.drum_note) != note {
                        continue;
                    }
                    return Some((program.clone(), true));
                }
            }

            let state = &mut self.midi_channel_states[midi_channel];
            if state.bank_msb == 125 && state.program != 1 {
                state.program = 1;
                continue;
            }
            break;
        }

        let fallback = self.libraries.first()?.programs.first()?;
        Some((fallback.clone(), false))
    }

    fn reset_midi_channel(&mut self, midi_channel: usize) {
        let state = &mut self.midi_channel_states[midi_channel];
        state.volume = 100;
        state.expression = 127;
        state.sustain = 0;
        state.pitch = 64;
        state.rpn = 0x3fff;
        state.pitch_sens = 200;
    }

    fn reset_all_midi_channels(&mut self) {
        for i in 0..self.midi_channel_states.len() {
            self.reset_midi_channel(i);
        }
    }

    fn release_all_slots(&mut self) {
        for i in 0..self.slots.len() {
            if self.slots[i].flags & FLAG_FREE == 0 {
                self.release_slot(i, true);
            }
        }
    }

    fn write_all_ops(&mut self, slot_id: usize, reg: OpReg, value: i32) {
        for op in 0..4 {
            self.registers.write_operator(slot_id, op, reg, value);
        }
    }

    /// Program a slot's frequency from a real note and pitch offset, writing
    /// FNUM and BLOCK before the KON state so the attack starts on a stable
    /// frequency.
    fn write_frequency(&mut self, slot_id: usize, note: i32, pitch: i32, keyon: bool) {
        let n = f64::from(note - A3_NOTE) + f64::from(pitch - 64) / 32.0;
        let freq = A3_FREQ * (n / 12.0).exp2();

        let mut block = note / 12;
        if 7 < block {
            block = 7;
        }

        let raw = (freq * FNUM_COEF) as i32;
        let mut fnum = if block < 1 { 0 } else { raw >> (block - 1) };
        if fnum < 0 {
            fnum = 0;
        } else {
            while 1024 < fnum {
                block += 1;
                fnum >>= 1;
            }
        }
        block = block.clamp(0, 7);

        self.registers.write_channel(slot_id, ChannelReg::Fnum, fnum);
        self.registers
            .write_channel(slot_id, ChannelReg::Block, block);
        self.registers
            .write_channel(slot_id, ChannelReg::Kon, i32::from(keyon));
    }

    fn write_velocity(&mut self, slot_id: usize, velocity: i32, instrument: &VoiceProgram) {
        for (i, op) in instrument.fm.operators.iter().enumerate() {
            let tl_modulator = i32::from(op.tl);
            let tl_carrier = convert_velocity(tl_modulator, velocity);
            self.registers.write_tl(slot_id, i, tl_carrier, tl_modulator);
        }
    }

    fn write_instrument(&mut self, slot_id: usize, instrument: &VoiceProgram) {
        self.write_all_ops(slot_id, OpReg::Tl, 0x3f); // silent while reprogramming

        for (i, op) in instrument.fm.operators.iter().enumerate() {
            self.registers
                .write_operator(slot_id, i, OpReg::Eam, i32::from(op.eam));
            self.registers
                .write_operator(slot_id, i, OpReg::Evb, i32::from(op.evb));
            self.registers
                .write_operator(slot_id, i, OpReg::Dam, i32::from(op.dam));
            self.registers
                .write_operator(slot_id, i, OpReg::Dvb, i32::from(op.dvb));
            self.registers
                .write_operator(slot_id, i, OpReg::Dt, i32::from(op.dt));
            self.registers
                .write_operator(slot_id, i, OpReg::Ksl, i32::from(op.ksl));
            self.registers
                .write_operator(slot_id, i, OpReg::Ksr, i32::from(op.ksr));
            self.registers
                .write_operator(slot_id, i, OpReg::Ws, i32::from(op.ws));
            self.registers
                .write_operator(slot_id, i, OpReg::Mult, i32::from(op.mult));
            self.registers
                .write_operator(slot_id, i, OpReg::Fb, i32::from(op.fb));
            self.registers
                .write_operator(slot_id, i, OpReg::Ar, i32::from(op.ar));
            self.registers
                .write_operator(slot_id, i, OpReg::Dr, i32::from(op.dr));
            self.registers
                .write_operator(slot_id, i, OpReg::Sl, i32::from(op.sl));
            self.registers
                .write_operator(slot_id, i, OpReg::Sr, i32::from(op.sr));
            self.registers
                .write_operator(slot_id, i, OpReg::Rr, i32::from(op.rr));
            self.registers
                .write_operator(slot_id, i, OpReg::Tl, i32::from(op.tl));
            self.registers
                .write_operator(slot_id, i, OpReg::Xof, i32::from(op.xof));
        }

        self.registers
            .write_channel(slot_id, ChannelReg::Alg, i32::from(instrument.fm.alg));
        self.registers
            .write_channel(slot_id, ChannelReg::Lfo, i32::from(instrument.fm.lfo));
        self.registers
            .write_channel(slot_id, ChannelReg::Panpot, i32::from(instrument.fm.panpot));
        self.registers
            .write_channel(slot_id, ChannelReg::Bo, i32::from(instrument.fm.bo));
    }

    /// Silence every channel: full attenuation, fastest envelopes, key off.
    fn shutup(&mut self) {
        for i in 0..self.slots.len() {
            self.write_all_ops(i, OpReg::Ksl, 0);
            self.write_all_ops(i, OpReg::Tl, 0x3f); // turn off volume
            self.write_all_ops(i, OpReg::Ar, 15); // the fastest attack,
            self.write_all_ops(i, OpReg::Dr, 15); // decay
            self.write_all_ops(i, OpReg::Sl, 0);
            self.write_all_ops(i, OpReg::Rr, 15); // ... and release
            self.registers.write_channel(i, ChannelReg::Kon, 0);
        }
    }
}
