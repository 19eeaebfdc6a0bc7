//! MA-5 FM synthesis chip emulator
//!
//! A software emulation of a four-operator FM synthesis sound chip in the
//! YMF/MA-5 family, driven by a MIDI-like control interface. The chip owns
//! 16 synthesis channels; each channel routes four operators through one of
//! eight fixed algorithms with selectable feedback paths and produces one
//! stereo frame per tick.
//!
//! # Layers
//! - [`tables`] - immutable lookup tables shared by every chip instance
//! - `operator` - phase generator + envelope generator + waveform evaluation
//! - `channel` - algorithm routing, feedback delay lines, LFO, panning
//! - [`Chip`] - the channel array behind the [`Registers`] write interface
//!   and the stereo sample-pull interface
//! - [`Controller`] - MIDI-level voice allocation driving any [`Registers`]
//!   implementation
//!
//! # Quick start
//! ```
//! use ma5::{ChannelReg, Chip, OpReg, Registers};
//!
//! let mut chip = Chip::new();
//! chip.write_channel(0, ChannelReg::Alg, 1); // operator 1 carries
//! chip.write_operator(0, 0, OpReg::Ar, 15); // fastest attack
//! chip.write_operator(0, 0, OpReg::Mult, 1);
//! chip.write_channel(0, ChannelReg::Fnum, 300); // ~440 Hz at block 4
//! chip.write_channel(0, ChannelReg::Block, 4);
//! chip.write_channel(0, ChannelReg::Velocity, 127);
//! chip.write_channel(0, ChannelReg::Kon, 1);
//! let (left, right) = chip.next();
//! # let _ = (left, right);
//! ```
//!
//! For note-level control, wrap the chip in a [`Controller`] and feed it MIDI
//! events together with a list of [`VoiceLibrary`] programs.
//!
//! The synthesis core is total: register writes saturate or mask out-of-range
//! values, and no operation blocks, fails or panics once a chip is
//! constructed. A chip instance must not be driven from more than one thread
//! at a time; the shared tables are read-only and may back any number of
//! concurrently-live instances.

#![warn(missing_docs)]

mod channel;
mod chip;
mod controller;
mod operator;
mod registers;
pub mod tables;
mod voice;

/// Error types for chip emulator operations
///
/// This enum only covers construction-time validation. The synthesis path
/// itself is total and never produces errors.
#[derive(thiserror::Error, Debug)]
pub enum Ma5Error {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for Ma5Error {
    /// Converts a String into `Ma5Error::Other`.
    fn from(msg: String) -> Self {
        Ma5Error::Other(msg)
    }
}

impl From<&str> for Ma5Error {
    /// Converts a string slice into `Ma5Error::Other`.
    fn from(msg: &str) -> Self {
        Ma5Error::Other(msg.to_string())
    }
}

/// Result type for emulator operations
pub type Result<T> = std::result::Result<T, Ma5Error>;

// Public API exports
pub use chip::Chip;
pub use controller::{convert_velocity, Controller};
pub use registers::{ChannelReg, OpReg, Registers};
pub use voice::{FmVoice, OperatorPatch, VoiceLibrary, VoiceProgram, VoiceType};
