//! `XmModule` related flags and closed enumerations.
use bitflags::bitflags;

/// The frequency table selected by the module header.
///
/// Linear periods are what FastTracker II defaults to; Amiga periods
/// reproduce the ProTracker pitch curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrequencyType {
    Linear = 0,
    Amiga = 1,
}

/// How a sample repeats once the play cursor passes its loop end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopType {
    None = 0,
    Forward = 1,
    PingPong = 2,
}

/// Oscillator shape used by vibrato, tremolo and autovibrato.
///
/// The discriminants follow the convention used after loading: the stored
/// instrument vibrato type has 1 and 2 swapped by the loader so that both
/// the effect-column control parameters and the instrument autovibrato
/// agree on this numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Waveform {
    Sine = 0,
    RampDown = 1,
    Square = 2,
    Random = 3,
}

bitflags! {
    /// Per-envelope control bits, as stored in the instrument header.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct EnvelopeFlags: u8 {
        const ENABLED = 0b0000_0001;
        const SUSTAIN = 0b0000_0010;
        const LOOP    = 0b0000_0100;
    }
}

bitflags! {
    /// Which parts of the channel state a note trigger leaves untouched.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TriggerFlags: u8 {
        const KEEP_VOLUME          = 0b0000_0001;
        const KEEP_PERIOD          = 0b0000_0010;
        const KEEP_SAMPLE_POSITION = 0b0000_0100;
        const KEEP_ENVELOPE        = 0b0000_1000;
    }
}

impl EnvelopeFlags {
    /// Returns `true` if the envelope is applied at all.
    pub fn is_enabled(self) -> bool {
        self.intersects(EnvelopeFlags::ENABLED)
    }

    /// Returns `true` if the envelope holds at its sustain point until key off.
    pub fn is_sustain_enabled(self) -> bool {
        self.intersects(EnvelopeFlags::SUSTAIN)
    }

    /// Returns `true` if the envelope loops between its loop points.
    pub fn is_loop_enabled(self) -> bool {
        self.intersects(EnvelopeFlags::LOOP)
    }
}

impl Waveform {
    /// Maps the low 2 bits of a control parameter to an oscillator shape.
    pub fn from_control_bits(bits: u8) -> Waveform {
        match bits & 3 {
            0 => Waveform::Sine,
            1 => Waveform::RampDown,
            2 => Waveform::Square,
            3 => Waveform::Random,
            _ => unreachable!(),
        }
    }
}

impl FrequencyType {
    /// Returns `true` when the module uses linear periods.
    pub fn is_linear(self) -> bool {
        self == FrequencyType::Linear
    }
}
