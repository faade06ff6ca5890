use arrayvec::ArrayVec;

pub mod flags;
mod analyze;
mod effects;
mod mixer;
mod parse;
mod player;
#[cfg(test)]
pub(crate) mod testkit;

pub use flags::*;
pub use parse::{LoadError, Prescan};

/// Number of entries in the pattern order table stored in the file header.
pub const PATTERN_ORDER_TABLE_LENGTH: usize = 256;

/// Number of playable notes (C-0 to B-7).
pub const NUM_NOTES: u8 = 96;

/// Maximum number of points in a volume or panning envelope.
pub const MAX_ENVELOPE_POINTS: usize = 12;

/// Maximum number of rows in a pattern.
pub const MAX_ROWS_PER_PATTERN: u16 = 256;

/// Maximum channel or sample volume.
pub const MAX_VOLUME: u8 = 64;

/// Maximum envelope point value.
pub const MAX_ENVELOPE_VALUE: u8 = 64;

/// Upper bound of the per-channel fadeout volume domain.
pub const MAX_FADEOUT_VOLUME: u16 = 32768;

/// Upper bound of the panning domain. Exceeds `u8::MAX` on purpose, this
/// is FastTracker II behaviour.
pub const MAX_PANNING: u16 = 256;

/// Lowest accepted BPM value.
pub const MIN_BPM: u8 = 32;

/// Highest accepted BPM value.
pub const MAX_BPM: u8 = 255;

/// Highest accepted tempo (ticks per row); `Fxx` params above this set BPM.
pub const MAX_TEMPO: u8 = 31;

/// Internal note value a key off is stored as after loading.
///
/// The file format stores key off as note 97; the loader remaps it so that
/// playable notes fit in the low 7 bits.
pub const KEY_OFF_NOTE: u8 = 128;

/// Number of audio frames a note change cross-fades over.
pub const RAMPING_POINTS: usize = 31;

/// Upper bound, in bytes, of the string produced by [XmContext::analyze].
pub const ANALYZE_OUTPUT_SIZE: usize = 162;

/// How much a channel's final volume may move per audio frame. Limits
/// abrupt volume changes which manifest as clicks in the output.
#[cfg(feature = "ramping")]
pub(crate) const RAMPING_VOLUME_RAMP: f32 = 1.0 / 128.0;

/// Final amplification of the generated frames. A compromise between too
/// quiet output and clipping.
pub(crate) const AMPLIFICATION: f32 = 0.25;

pub(crate) fn note_is_valid(note: u8) -> bool {
    note & !KEY_OFF_NOTE != 0
}

pub(crate) fn note_is_key_off(note: u8) -> bool {
    note & KEY_OFF_NOTE != 0
}

/// One point of a piecewise-linear envelope.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopePoint {
    /// Tick count since the note trigger. Strictly increasing along an
    /// envelope.
    pub frame: u16,
    /// Envelope value at this point, `0..=MAX_ENVELOPE_VALUE`.
    pub value: u8,
}

/// A volume or panning envelope of an instrument.
#[derive(Debug, Default, Clone)]
pub struct Envelope {
    /// The envelope points. Frames are strictly increasing.
    pub points: ArrayVec<EnvelopePoint, MAX_ENVELOPE_POINTS>,
    /// Point index the envelope holds at while the note is sustained.
    pub sustain_point: u8,
    /// Point index the envelope loop jumps back to.
    pub loop_start_point: u8,
    /// Point index the envelope loop ends at.
    pub loop_end_point: u8,
    /// Enable bits for the envelope, its sustain point and its loop.
    pub flags: EnvelopeFlags,
}

/// A sample waveform and its playback parameters.
///
/// All offsets and lengths are in sample points, never bytes: the loader
/// halves them for 16-bit samples.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Start of the waveform in the module's sample data arena.
    pub(crate) data_index: u32,
    /// Length in sample points.
    pub length: u32,
    pub loop_start: u32,
    pub loop_length: u32,
    /// `loop_start + loop_length`, or `length` for non-looping samples.
    pub loop_end: u32,
    /// Default volume, `0..=MAX_VOLUME`.
    pub volume: u8,
    /// Default panning, `0` full left to `255` full right.
    pub panning: u8,
    pub loop_type: LoopType,
    /// Stored bit depth, 8 or 16. Selects the normalisation divisor.
    pub bits: u8,
    /// Pitch correction in 1/128 semitone steps.
    pub finetune: i8,
    /// Signed semitone offset added to every note played on this sample.
    pub relative_note: i8,
    /// Sample name from the file.
    #[cfg(feature = "strings")]
    pub name: String,
}

/// An instrument: a note→sample map, envelopes and autovibrato settings.
#[derive(Debug, Clone)]
pub struct Instrument {
    /// Start of this instrument's samples in the module's sample table.
    pub(crate) samples_index: u16,
    pub num_samples: u16,
    /// Which of the instrument's samples each of the 96 notes plays.
    pub sample_of_notes: [u8; NUM_NOTES as usize],
    pub volume_envelope: Envelope,
    pub panning_envelope: Envelope,
    /// Volume decrement per tick after key off.
    pub volume_fadeout: u16,
    pub vibrato_type: Waveform,
    /// Ticks over which the autovibrato depth fades in.
    pub vibrato_sweep: u8,
    pub vibrato_depth: u8,
    pub vibrato_rate: u8,
    /// Instrument name from the file.
    #[cfg(feature = "strings")]
    pub name: String,
}

/// The intersection of one pattern row and one channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PatternSlot {
    /// `0` = no note, `1..=96` = notes, [KEY_OFF_NOTE] = key off.
    pub note: u8,
    /// `0` = no instrument, `1..=128` = instruments.
    pub instrument: u8,
    pub volume_column: u8,
    pub effect_type: u8,
    pub effect_param: u8,
}

impl PatternSlot {
    /// `3xx`, `5xy` and the `Mx` volume column all run a tone portamento.
    pub(crate) fn has_tone_portamento(&self) -> bool {
        self.effect_type == 3 || self.effect_type == 5
            || self.volume_column >> 4 == 0xF
    }

    /// `4xy`, `6xy` and the `Vx` volume column all run a vibrato.
    pub(crate) fn has_vibrato(&self) -> bool {
        self.effect_type == 4 || self.effect_type == 6
            || self.volume_column >> 4 == 0xB
    }

    pub(crate) fn has_arpeggio(&self) -> bool {
        self.effect_type == 0 && self.effect_param != 0
    }
}

/// A pattern: a window of `num_rows · num_channels` slots in the module's
/// flat slot table.
#[derive(Debug, Clone, Copy)]
pub struct Pattern {
    pub(crate) slots_index: u32,
    pub num_rows: u16,
}

/// The loaded module. Immutable after loading: all playback state lives in
/// the [XmContext] that owns it.
///
/// Patterns, instruments and samples use flat tables with typed indices:
/// a [Pattern] indexes into `pattern_slots`, an [Instrument] indexes into
/// `samples`, a [Sample] indexes into `samples_data`. Nothing is allocated
/// after the module has been loaded.
#[derive(Debug, Clone)]
pub struct XmModule {
    /// Number of entries used in the pattern order table.
    pub length: u16,
    /// Pattern order index playback restarts from after the last entry.
    pub restart_position: u16,
    pub num_channels: u16,
    pub frequency_type: FrequencyType,
    /// The pattern order table. Entries at `length..` are unused.
    pub pattern_table: [u8; PATTERN_ORDER_TABLE_LENGTH],
    pub patterns: Box<[Pattern]>,
    pub pattern_slots: Box<[PatternSlot]>,
    pub instruments: Box<[Instrument]>,
    pub samples: Box<[Sample]>,
    /// Delta-decoded sample points. 8-bit points are stored sign-extended;
    /// [Sample::bits] keeps the original depth for normalisation.
    pub samples_data: Box<[i16]>,
    /// Module name from the file.
    #[cfg(feature = "strings")]
    pub name: String,
    /// Name of the tracker that wrote the file.
    #[cfg(feature = "strings")]
    pub tracker_name: String,
}

impl XmModule {
    #[inline]
    pub(crate) fn instrument(&self, index: u16) -> &Instrument {
        &self.instruments[index as usize]
    }

    #[inline]
    pub(crate) fn sample(&self, index: u16) -> &Sample {
        &self.samples[index as usize]
    }
}

/// Per-channel playback state.
#[derive(Debug, Clone)]
pub(crate) struct ChannelState {
    /// Index of the current instrument in the module instrument table.
    pub(crate) instrument: Option<u16>,
    /// Index of the current sample in the module sample table.
    pub(crate) sample: Option<u16>,
    /// Copy of the pattern slot being processed this row.
    pub(crate) current: PatternSlot,

    /// Current note in semitones, incorporating relative note and finetune.
    pub(crate) note: f32,
    /// The note as read from the pattern, before effect modifications.
    pub(crate) orig_note: f32,

    pub(crate) sample_position: f32,
    pub(crate) period: f32,
    pub(crate) tone_portamento_target_period: f32,
    pub(crate) frequency: f32,
    /// Sample points consumed per generated audio frame.
    pub(crate) step: f32,

    /// Left/right multipliers applied to the generated sample.
    pub(crate) actual_volume: [f32; 2],
    /// Left/right multipliers the actual volume ramps towards. Updated at
    /// the end of each tick.
    #[cfg(feature = "ramping")]
    pub(crate) target_volume: [f32; 2],
    /// Frames generated since the latest note change.
    #[cfg(feature = "ramping")]
    pub(crate) frame_count: u32,
    /// Ring of upcoming points of the previous sample stream, cross-faded
    /// into the new stream after a note change.
    #[cfg(feature = "ramping")]
    pub(crate) end_of_previous_sample: [f32; RAMPING_POINTS],

    /// `0..=MAX_FADEOUT_VOLUME-1`, decremented after key off.
    pub(crate) fadeout_volume: u16,

    pub(crate) autovibrato_ticks: u16,
    pub(crate) volume_envelope_frame_count: u16,
    pub(crate) panning_envelope_frame_count: u16,
    pub(crate) volume_envelope_volume: u8,
    pub(crate) panning_envelope_panning: u8,

    pub(crate) volume: u8,
    pub(crate) panning: u8,

    /// Autovibrato pitch offset in 1/128 note increments.
    pub(crate) autovibrato_note_offset: i8,
    pub(crate) arp_note_offset: u8,
    pub(crate) volume_slide_param: u8,
    pub(crate) fine_volume_slide_param: u8,
    pub(crate) global_volume_slide_param: u8,
    pub(crate) panning_slide_param: u8,
    pub(crate) portamento_up_param: u8,
    pub(crate) portamento_down_param: u8,
    pub(crate) fine_portamento_up_param: u8,
    pub(crate) fine_portamento_down_param: u8,
    pub(crate) extra_fine_portamento_up_param: u8,
    pub(crate) extra_fine_portamento_down_param: u8,
    pub(crate) tone_portamento_param: u8,
    pub(crate) multi_retrig_param: u8,
    pub(crate) note_delay_param: u8,
    /// Row an `E6y` loop jumps back to.
    pub(crate) pattern_loop_origin: u8,
    /// How many `E6y` loop passes have been done.
    pub(crate) pattern_loop_count: u8,
    pub(crate) tremor_param: u8,
    pub(crate) sample_offset_param: u8,

    pub(crate) tremolo_param: u8,
    pub(crate) tremolo_control_param: u8,
    pub(crate) tremolo_ticks: u8,
    pub(crate) tremolo_volume_offset: i8,

    pub(crate) vibrato_param: u8,
    pub(crate) vibrato_control_param: u8,
    pub(crate) vibrato_ticks: u8,
    /// Vibrato pitch offset in 1/16 note increments.
    pub(crate) vibrato_note_offset: i8,

    pub(crate) sustained: bool,
    pub(crate) muted: bool,
    pub(crate) should_reset_vibrato: bool,
    pub(crate) should_reset_arpeggio: bool,
    pub(crate) tremor_on: bool,
}

impl ChannelState {
    pub(crate) fn fresh() -> ChannelState {
        ChannelState {
            instrument: None,
            sample: None,
            current: PatternSlot::default(),
            note: 0.0,
            orig_note: 0.0,
            sample_position: 0.0,
            period: 0.0,
            tone_portamento_target_period: 0.0,
            frequency: 0.0,
            step: 0.0,
            actual_volume: [0.0; 2],
            #[cfg(feature = "ramping")]
            target_volume: [0.0; 2],
            #[cfg(feature = "ramping")]
            frame_count: 0,
            #[cfg(feature = "ramping")]
            end_of_previous_sample: [0.0; RAMPING_POINTS],
            fadeout_volume: MAX_FADEOUT_VOLUME - 1,
            autovibrato_ticks: 0,
            volume_envelope_frame_count: 0,
            panning_envelope_frame_count: 0,
            volume_envelope_volume: MAX_ENVELOPE_VALUE,
            panning_envelope_panning: MAX_ENVELOPE_VALUE / 2,
            volume: MAX_VOLUME,
            panning: 128,
            autovibrato_note_offset: 0,
            arp_note_offset: 0,
            volume_slide_param: 0,
            fine_volume_slide_param: 0,
            global_volume_slide_param: 0,
            panning_slide_param: 0,
            portamento_up_param: 0,
            portamento_down_param: 0,
            fine_portamento_up_param: 0,
            fine_portamento_down_param: 0,
            extra_fine_portamento_up_param: 0,
            extra_fine_portamento_down_param: 0,
            tone_portamento_param: 0,
            multi_retrig_param: 0,
            note_delay_param: 0,
            pattern_loop_origin: 0,
            pattern_loop_count: 0,
            tremor_param: 0,
            sample_offset_param: 0,
            tremolo_param: 0,
            tremolo_control_param: 0,
            tremolo_ticks: 0,
            tremolo_volume_offset: 0,
            vibrato_param: 0,
            vibrato_control_param: 0,
            vibrato_ticks: 0,
            vibrato_note_offset: 0,
            sustained: false,
            muted: false,
            should_reset_vibrato: false,
            should_reset_arpeggio: false,
            tremor_on: false,
        }
    }
}

/// A loaded module together with all of its playback state.
///
/// Create one with [XmContext::load] (or [crate::load_file]), then pull
/// audio out of it with [XmContext::generate_samples]. A context is fully
/// self-contained; distinct contexts are independent and may be driven
/// from different threads.
#[derive(Debug, Clone)]
pub struct XmContext {
    pub(crate) module: XmModule,
    pub(crate) channels: Box<[ChannelState]>,
    /// How many times each (order position, row) pair has been played;
    /// used to detect that the module has looped.
    pub(crate) row_loop_count: Box<[u8]>,
    /// Mute flags of instruments, kept outside the immutable module.
    pub(crate) instrument_muted: Box<[bool]>,

    pub(crate) generated_samples: u64,
    pub(crate) remaining_samples_in_tick: f32,
    /// Output sample rate, typically 44100 or 48000.
    pub(crate) rate: u16,

    pub(crate) current_tick: u16,
    /// Carried tick surplus from the `EEy` pattern delay effect.
    pub(crate) extra_ticks: u16,

    /// Ticks per row.
    pub(crate) tempo: u8,
    pub(crate) bpm: u8,

    pub(crate) global_volume: u8,
    pub(crate) current_table_index: u8,
    pub(crate) current_row: u8,

    pub(crate) position_jump: bool,
    pub(crate) pattern_break: bool,
    pub(crate) jump_dest: u8,
    pub(crate) jump_row: u8,

    pub(crate) loop_count: u8,
    pub(crate) max_loop_count: u8,

    pub(crate) amplification: f32,
    #[cfg(feature = "ramping")]
    pub(crate) volume_ramp: f32,
    /// State of the random waveform generator. Kept in the context so that
    /// playback stays deterministic across contexts in one process.
    pub(crate) next_rand: u32,
}

impl XmContext {
    /// Returns the loaded module.
    pub fn module(&self) -> &XmModule {
        &self.module
    }

    /// Returns the output sample rate.
    pub fn sample_rate(&self) -> u16 {
        self.rate
    }

    /// Changes the output sample rate. Takes effect from the next
    /// generated tick onwards.
    pub fn set_sample_rate(&mut self, rate: u16) {
        self.rate = rate;
    }

    /// Sets the maximum number of times the module may loop. After the
    /// specified number of loops, the generate operations only produce
    /// silence. `0` loops indefinitely.
    pub fn set_max_loop_count(&mut self, loopcnt: u8) {
        self.max_loop_count = loopcnt;
    }

    /// Returns the loop count of the module: `0` while the module is still
    /// in its first pass, `1` once it has looped, and so on.
    pub fn loop_count(&self) -> u8 {
        self.loop_count
    }

    /// Moves the playback cursor to the given pattern order position,
    /// row and tick. The next generated frame re-enters the sequencer at
    /// the new cursor.
    pub fn seek(&mut self, pot: u8, row: u8, tick: u16) {
        let pot = if (pot as u16) < self.module.length { pot } else { 0 };
        self.current_table_index = pot;
        self.current_row = row;
        self.current_tick = tick;
        self.remaining_samples_in_tick = 0.0;
    }

    /// Mutes or unmutes a channel (`1..=num_channels`). Returns the
    /// previous mute flag.
    pub fn mute_channel(&mut self, channel: u16, mute: bool) -> bool {
        if !self.valid_channel(channel) {
            return false;
        }
        let muted = &mut self.channels[channel as usize - 1].muted;
        core::mem::replace(muted, mute)
    }

    /// Mutes or unmutes an instrument (`1..=num_instruments`). Returns the
    /// previous mute flag.
    pub fn mute_instrument(&mut self, instrument: u16, mute: bool) -> bool {
        if !self.valid_instrument(instrument) {
            return false;
        }
        let muted = &mut self.instrument_muted[instrument as usize - 1];
        core::mem::replace(muted, mute)
    }

    /// Returns the current `(bpm, tempo)` pair, tempo in ticks per row.
    pub fn playing_speed(&self) -> (u8, u8) {
        (self.bpm, self.tempo)
    }

    /// Returns the playback cursor as `(pattern order index, pattern, row,
    /// generated frame count)`.
    pub fn position(&self) -> (u8, u8, u8, u64) {
        (
            self.current_table_index,
            self.module.pattern_table[self.current_table_index as usize],
            self.current_row,
            self.generated_samples,
        )
    }

    /// Returns `true` if the channel (`1..=num_channels`) currently has
    /// both an instrument and a sample loaded.
    pub fn is_channel_active(&self, channel: u16) -> bool {
        if !self.valid_channel(channel) {
            return false;
        }
        let ch = &self.channels[channel as usize - 1];
        ch.instrument.is_some() && ch.sample.is_some()
    }

    /// Returns the frequency in Hz the channel is playing its sample at.
    pub fn frequency_of_channel(&self, channel: u16) -> f32 {
        if !self.valid_channel(channel) {
            return 0.0;
        }
        self.channels[channel as usize - 1].frequency
    }

    /// Returns the channel volume scaled by the global volume, `0.0..=1.0`.
    pub fn volume_of_channel(&self, channel: u16) -> f32 {
        if !self.valid_channel(channel) {
            return 0.0;
        }
        let volume = self.channels[channel as usize - 1].volume;
        f32::from(volume) * f32::from(self.global_volume)
            / (f32::from(MAX_VOLUME) * f32::from(MAX_VOLUME))
    }

    /// Returns the channel panning, `0.0` full left to `1.0` full right.
    pub fn panning_of_channel(&self, channel: u16) -> f32 {
        if !self.valid_channel(channel) {
            return 0.0;
        }
        f32::from(self.channels[channel as usize - 1].panning) / 255.0
    }

    /// Returns the 1-based instrument the channel plays, or `0` for none.
    pub fn instrument_of_channel(&self, channel: u16) -> u16 {
        if !self.valid_channel(channel) {
            return 0;
        }
        match self.channels[channel as usize - 1].instrument {
            Some(index) => index + 1,
            None => 0,
        }
    }

    /// Returns the number of channels.
    pub fn num_channels(&self) -> u16 {
        self.module.num_channels
    }

    /// Returns the module length (in pattern order entries).
    pub fn module_length(&self) -> u16 {
        self.module.length
    }

    /// Returns the number of patterns.
    pub fn num_patterns(&self) -> u16 {
        self.module.patterns.len() as u16
    }

    /// Returns the number of rows of a pattern.
    pub fn num_rows_of_pattern(&self, pattern: u16) -> u16 {
        if !self.valid_pattern(pattern) {
            return 0;
        }
        self.module.patterns[pattern as usize].num_rows
    }

    /// Returns the number of instruments.
    pub fn num_instruments(&self) -> u16 {
        self.module.instruments.len() as u16
    }

    /// Returns the number of samples of an instrument
    /// (`1..=num_instruments`).
    pub fn num_samples_of_instrument(&self, instrument: u16) -> u16 {
        if !self.valid_instrument(instrument) {
            return 0;
        }
        self.module.instruments[instrument as usize - 1].num_samples
    }

    /// Returns the waveform points of a sample and its stored bit depth.
    /// `instrument` is 1-based, `sample` is 0-based within the instrument.
    pub fn sample_waveform(&self, instrument: u16, sample: u16) -> (&[i16], u8) {
        if !self.valid_sample(instrument, sample) {
            return (&[], 8);
        }
        let instr = &self.module.instruments[instrument as usize - 1];
        let smp = self.module.sample(instr.samples_index + sample);
        let start = smp.data_index as usize;
        let end = start + smp.length as usize;
        (&self.module.samples_data[start..end], smp.bits)
    }

    /// Returns the module name.
    #[cfg(feature = "strings")]
    pub fn module_name(&self) -> &str {
        &self.module.name
    }

    /// Returns the name of the tracker that wrote the module.
    #[cfg(feature = "strings")]
    pub fn tracker_name(&self) -> &str {
        &self.module.tracker_name
    }

    fn valid_channel(&self, channel: u16) -> bool {
        let ok = channel >= 1 && channel <= self.module.num_channels;
        debug_assert!(ok, "invalid channel {}", channel);
        ok
    }

    fn valid_instrument(&self, instrument: u16) -> bool {
        let ok = instrument >= 1
            && (instrument as usize) <= self.module.instruments.len();
        debug_assert!(ok, "invalid instrument {}", instrument);
        ok
    }

    fn valid_pattern(&self, pattern: u16) -> bool {
        let ok = (pattern as usize) < self.module.patterns.len();
        debug_assert!(ok, "invalid pattern {}", pattern);
        ok
    }

    fn valid_sample(&self, instrument: u16, sample: u16) -> bool {
        if !self.valid_instrument(instrument) {
            return false;
        }
        let ok =
            sample < self.module.instruments[instrument as usize - 1].num_samples;
        debug_assert!(ok, "invalid sample {} for instrument {}", sample, instrument);
        ok
    }
}
