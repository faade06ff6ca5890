use core::fmt;
use std::io;

use arrayvec::ArrayVec;
use log::warn;

use super::*;

#[cfg(feature = "strings")]
const MODULE_NAME_LENGTH: usize = 20;
#[cfg(feature = "strings")]
const TRACKER_NAME_LENGTH: usize = 20;
#[cfg(feature = "strings")]
const INSTRUMENT_NAME_LENGTH: usize = 22;
#[cfg(feature = "strings")]
const SAMPLE_NAME_LENGTH: usize = 22;

/// Why a module failed to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// Preload sanity failed: truncated header, wrong magic or a version
    /// other than XM 1.04.
    Malformed(&'static str),
    /// Postload sanity failed: the parsed module is inconsistent.
    Invalid(&'static str),
    /// A module table could not be allocated.
    OutOfMemory,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Malformed(what) => write!(f, "malformed module: {}", what),
            LoadError::Invalid(what) => write!(f, "invalid module: {}", what),
            LoadError::OutOfMemory => f.write_str("module tables could not be allocated"),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<LoadError> for io::Error {
    fn from(e: LoadError) -> io::Error {
        let kind = match e {
            LoadError::OutOfMemory => io::ErrorKind::OutOfMemory,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, e.to_string())
    }
}

/// Bounded little-endian reader over the module bytes.
///
/// Reads past the end of the buffer behave as if the buffer was infinitely
/// padded with zero bytes; the loader never reads out of bounds.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data }
    }

    #[inline]
    fn u8_at(&self, offset: usize) -> u8 {
        self.data.get(offset).copied().unwrap_or(0)
    }

    #[inline]
    fn u16_at(&self, offset: usize) -> u16 {
        u16::from(self.u8_at(offset))
            | u16::from(self.u8_at(offset.wrapping_add(1))) << 8
    }

    #[inline]
    fn u32_at(&self, offset: usize) -> u32 {
        u32::from(self.u16_at(offset))
            | u32::from(self.u16_at(offset.wrapping_add(2))) << 16
    }

    fn copy_at(&self, offset: usize, dst: &mut [u8]) {
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = self.u8_at(offset.wrapping_add(i));
        }
    }

    /// Reads a fixed-size, possibly NUL-padded string field.
    #[cfg(feature = "strings")]
    fn str_at(&self, offset: usize, len: usize) -> String {
        let bytes: Vec<u8> = (0..len)
            .map(|i| self.u8_at(offset.wrapping_add(i)))
            .take_while(|&b| b != 0)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn check_sanity_preload(data: &[u8]) -> Result<(), LoadError> {
    if data.len() < 60 {
        return Err(LoadError::Malformed("file shorter than the XM header"));
    }
    if &data[0..17] != b"Extended Module: " {
        return Err(LoadError::Malformed("bad magic"));
    }
    if data[37] != 0x1A {
        return Err(LoadError::Malformed("missing header terminator byte"));
    }
    if data[58] != 0x04 || data[59] != 0x01 {
        return Err(LoadError::Malformed("not an XM 1.04 file"));
    }
    Ok(())
}

fn sanitize_num_rows(num_rows: u16) -> u16 {
    num_rows.clamp(1, MAX_ROWS_PER_PATTERN)
}

fn sanitize_note(note: u8) -> u8 {
    match note {
        97 => KEY_OFF_NOTE,
        n if n > NUM_NOTES => 0,
        n => n,
    }
}

/// Exact table sizes of a module, computed in a single pass over the file
/// before anything is allocated.
///
/// [XmContext::create] sizes every table from its prescan and performs no
/// further allocation during playback.
#[derive(Debug, Clone, Copy)]
pub struct Prescan {
    num_channels: u16,
    num_patterns: u16,
    num_instruments: u16,
    num_samples: u32,
    num_slots: u64,
    samples_data_length: u64,
    pot_length: u16,
}

impl Prescan {
    /// Walks the module bytes and computes the exact size of every table
    /// of the context that would be created from them.
    pub fn of_module(data: &[u8]) -> Result<Prescan, LoadError> {
        check_sanity_preload(data)?;
        let r = Reader::new(data);

        let mut offset = 60usize;
        let header_size = r.u32_at(offset);
        let pot_length = r
            .u16_at(offset + 4)
            .min(PATTERN_ORDER_TABLE_LENGTH as u16);
        let num_channels = r.u16_at(offset + 8);
        let num_patterns = r.u16_at(offset + 10);
        let num_instruments = r.u16_at(offset + 12);
        offset = offset.saturating_add(header_size as usize);

        let mut num_slots = 0u64;
        for _ in 0..num_patterns {
            let num_rows = sanitize_num_rows(r.u16_at(offset + 5));
            num_slots += u64::from(num_rows) * u64::from(num_channels);
            offset = offset
                .saturating_add(r.u32_at(offset) as usize)
                .saturating_add(r.u16_at(offset + 7) as usize);
        }

        let mut num_samples = 0u32;
        let mut samples_data_length = 0u64;
        for _ in 0..num_instruments {
            let instrument_samples = r.u16_at(offset + 27);
            num_samples += u32::from(instrument_samples);
            let sample_header_size = if instrument_samples > 0 {
                r.u32_at(offset + 29)
            } else {
                0
            };
            offset = offset.saturating_add(r.u32_at(offset) as usize);

            let mut data_bytes = 0u64;
            for _ in 0..instrument_samples {
                let byte_length = u64::from(r.u32_at(offset));
                let flags = r.u8_at(offset + 14);
                samples_data_length += if flags & 0x10 != 0 {
                    byte_length / 2
                } else {
                    byte_length
                };
                data_bytes += byte_length;
                offset = offset.saturating_add(sample_header_size as usize);
            }
            offset = offset.saturating_add(data_bytes.min(usize::MAX as u64) as usize);
        }

        Ok(Prescan {
            num_channels,
            num_patterns,
            num_instruments,
            num_samples,
            num_slots,
            samples_data_length,
            pot_length,
        })
    }

    /// Total in-memory cost of the context, in bytes.
    ///
    /// Saturates at `u32::MAX`; creating such a context fails with
    /// [LoadError::OutOfMemory] long before that.
    pub fn context_size(&self) -> u32 {
        use core::mem::size_of;
        let size = size_of::<XmContext>() as u64
            + u64::from(self.num_patterns) * size_of::<Pattern>() as u64
            + self.num_slots * size_of::<PatternSlot>() as u64
            + u64::from(self.num_instruments) * size_of::<Instrument>() as u64
            + u64::from(self.num_samples) * size_of::<Sample>() as u64
            + self.samples_data_length * size_of::<i16>() as u64
            + u64::from(self.num_channels) * size_of::<ChannelState>() as u64
            + u64::from(self.pot_length) * u64::from(MAX_ROWS_PER_PATTERN)
            + u64::from(self.num_instruments);
        size.min(u64::from(u32::MAX)) as u32
    }
}

impl XmContext {
    /// Parses the module bytes and prepares a playback context rendering
    /// at `rate` audio frames per second.
    pub fn load(data: &[u8], rate: u16) -> Result<XmContext, LoadError> {
        let prescan = Prescan::of_module(data)?;
        XmContext::create(&prescan, data, rate)
    }

    /// Builds a playback context from a [Prescan] and the same module
    /// bytes the prescan was computed from.
    ///
    /// Every table is allocated to the exact size the prescan reported;
    /// no allocation happens afterwards, in particular not on the audio
    /// path.
    pub fn create(prescan: &Prescan, data: &[u8], rate: u16) -> Result<XmContext, LoadError> {
        check_sanity_preload(data)?;
        let (mut module, tempo, bpm) = load_module(prescan, data)?;
        check_sanity_postload(&mut module)?;

        let channels: Vec<ChannelState> = (0..module.num_channels)
            .map(|_| ChannelState::fresh())
            .collect();
        let row_loop_count =
            vec![0u8; module.length as usize * MAX_ROWS_PER_PATTERN as usize];
        let instrument_muted = vec![false; module.instruments.len()];

        Ok(XmContext {
            module,
            channels: channels.into_boxed_slice(),
            row_loop_count: row_loop_count.into_boxed_slice(),
            instrument_muted: instrument_muted.into_boxed_slice(),
            generated_samples: 0,
            remaining_samples_in_tick: 0.0,
            rate,
            current_tick: 0,
            extra_ticks: 0,
            tempo,
            bpm,
            global_volume: MAX_VOLUME,
            current_table_index: 0,
            current_row: 0,
            position_jump: false,
            pattern_break: false,
            jump_dest: 0,
            jump_row: 0,
            loop_count: 0,
            max_loop_count: 0,
            amplification: AMPLIFICATION,
            #[cfg(feature = "ramping")]
            volume_ramp: RAMPING_VOLUME_RAMP,
            next_rand: 24492,
        })
    }
}

fn load_module(prescan: &Prescan, data: &[u8]) -> Result<(XmModule, u8, u8), LoadError> {
    let r = Reader::new(data);

    #[cfg(feature = "strings")]
    let name = r.str_at(17, MODULE_NAME_LENGTH);
    #[cfg(feature = "strings")]
    let tracker_name = r.str_at(38, TRACKER_NAME_LENGTH);

    let mut offset = 60usize;
    let header_size = r.u32_at(offset);
    let mut length = r.u16_at(offset + 4);
    let mut restart_position = r.u16_at(offset + 6);
    let num_channels = r.u16_at(offset + 8);
    let num_patterns = r.u16_at(offset + 10);
    let num_instruments = r.u16_at(offset + 12);
    let flags = r.u16_at(offset + 14);
    let frequency_type = if flags & 1 != 0 {
        FrequencyType::Linear
    } else {
        FrequencyType::Amiga
    };
    let tempo = r.u16_at(offset + 16).clamp(1, u16::from(MAX_TEMPO)) as u8;
    let bpm = r
        .u16_at(offset + 18)
        .clamp(u16::from(MIN_BPM), u16::from(MAX_BPM)) as u8;

    let mut pattern_table = [0u8; PATTERN_ORDER_TABLE_LENGTH];
    r.copy_at(offset + 20, &mut pattern_table);

    if length as usize > PATTERN_ORDER_TABLE_LENGTH {
        length = PATTERN_ORDER_TABLE_LENGTH as u16;
    }
    if length == 0 {
        return Err(LoadError::Invalid("empty pattern order table"));
    }
    if restart_position >= length {
        restart_position = 0;
    }
    offset = offset.saturating_add(header_size as usize);

    /* Patterns */
    if prescan.num_slots > u64::from(u32::MAX) {
        return Err(LoadError::OutOfMemory);
    }
    let mut patterns = Vec::with_capacity(prescan.num_patterns as usize);
    let mut pattern_slots: Vec<PatternSlot> = Vec::new();
    pattern_slots
        .try_reserve_exact(prescan.num_slots as usize)
        .map_err(|_| LoadError::OutOfMemory)?;

    for _ in 0..num_patterns {
        let num_rows = sanitize_num_rows(r.u16_at(offset + 5));
        let packed_size = r.u16_at(offset + 7) as usize;
        let slots_index = pattern_slots.len() as u32;
        let num_slots = num_rows as usize * num_channels as usize;
        patterns.push(Pattern { slots_index, num_rows });
        pattern_slots.resize(slots_index as usize + num_slots, PatternSlot::default());

        /* Pattern header length */
        offset = offset.saturating_add(r.u32_at(offset) as usize);
        if packed_size > 0 {
            let slots = &mut pattern_slots[slots_index as usize..];
            unpack_pattern(&r, offset, packed_size, &mut slots[..num_slots]);
        }
        offset = offset.saturating_add(packed_size);
    }

    /* Instruments */
    if prescan.num_samples > u32::from(u16::MAX) {
        return Err(LoadError::Invalid("too many samples"));
    }
    if prescan.samples_data_length > u64::from(u32::MAX) {
        return Err(LoadError::OutOfMemory);
    }
    let mut instruments = Vec::with_capacity(prescan.num_instruments as usize);
    let mut samples = Vec::with_capacity(prescan.num_samples as usize);
    let mut samples_data: Vec<i16> = Vec::new();
    samples_data
        .try_reserve_exact(prescan.samples_data_length as usize)
        .map_err(|_| LoadError::OutOfMemory)?;

    for _ in 0..num_instruments {
        let num_samples = r.u16_at(offset + 27);
        let samples_index = samples.len() as u16;
        let mut instr = Instrument {
            samples_index,
            num_samples,
            sample_of_notes: [0u8; NUM_NOTES as usize],
            volume_envelope: Envelope::default(),
            panning_envelope: Envelope::default(),
            volume_fadeout: 0,
            vibrato_type: Waveform::Sine,
            vibrato_sweep: 0,
            vibrato_depth: 0,
            vibrato_rate: 0,
            #[cfg(feature = "strings")]
            name: r.str_at(offset + 4, INSTRUMENT_NAME_LENGTH),
        };

        let mut sample_header_size = 0usize;
        if num_samples > 0 {
            sample_header_size = r.u32_at(offset + 29) as usize;
            r.copy_at(offset + 33, &mut instr.sample_of_notes);
            for value in instr.sample_of_notes.iter_mut() {
                if u16::from(*value) >= num_samples {
                    *value = (num_samples - 1) as u8;
                }
            }

            instr.volume_envelope = load_envelope(
                &r,
                offset + 129,
                r.u8_at(offset + 225),
                r.u8_at(offset + 227),
                r.u8_at(offset + 228),
                r.u8_at(offset + 229),
                r.u8_at(offset + 233),
            );
            instr.panning_envelope = load_envelope(
                &r,
                offset + 177,
                r.u8_at(offset + 226),
                r.u8_at(offset + 230),
                r.u8_at(offset + 231),
                r.u8_at(offset + 232),
                r.u8_at(offset + 234),
            );

            /* Stored types 1 and 2 are swapped relative to the ramp
               convention used by the control-parameter waveforms. */
            let vibrato_type = match r.u8_at(offset + 235) {
                1 => 2,
                2 => 1,
                other => other,
            };
            instr.vibrato_type = Waveform::from_control_bits(vibrato_type);
            instr.vibrato_sweep = r.u8_at(offset + 236);
            instr.vibrato_depth = r.u8_at(offset + 237);
            instr.vibrato_rate = r.u8_at(offset + 238);
            instr.volume_fadeout = r.u16_at(offset + 239);
        }

        /* Instrument header size */
        offset = offset.saturating_add(r.u32_at(offset) as usize);

        /* Sample headers first, then all waveform data */
        let mut next_data_index = samples_data.len() as u32;
        for _ in 0..num_samples {
            let mut length = r.u32_at(offset);
            let mut loop_start = r.u32_at(offset + 4);
            let mut loop_length = r.u32_at(offset + 8);
            let volume = r.u8_at(offset + 12).min(MAX_VOLUME);
            let finetune = r.u8_at(offset + 13) as i8;
            let flags = r.u8_at(offset + 14);
            let mut loop_type = match flags & 3 {
                0 => LoopType::None,
                1 => LoopType::Forward,
                _ => LoopType::PingPong,
            };
            let bits = if flags & 0x10 != 0 { 16 } else { 8 };
            let panning = r.u8_at(offset + 15);
            let relative_note = r.u8_at(offset + 16) as i8;
            #[cfg(feature = "strings")]
            let sample_name = r.str_at(offset + 18, SAMPLE_NAME_LENGTH);

            if bits == 16 {
                /* All sample offsets are in sample points from now on */
                length >>= 1;
                loop_start >>= 1;
                loop_length >>= 1;
            }
            let mut loop_end = loop_start.saturating_add(loop_length);
            if loop_end > length {
                loop_end = length;
            }
            if loop_start > length {
                loop_start = length;
            }
            loop_length = loop_end.saturating_sub(loop_start);
            if loop_length == 0 {
                loop_type = LoopType::None;
            }
            if loop_type == LoopType::None {
                loop_end = length;
            }

            samples.push(Sample {
                data_index: next_data_index,
                length,
                loop_start,
                loop_length,
                loop_end,
                volume,
                panning,
                loop_type,
                bits,
                finetune,
                relative_note,
                #[cfg(feature = "strings")]
                name: sample_name,
            });
            next_data_index += length;
            offset = offset.saturating_add(sample_header_size);
        }

        for j in 0..num_samples {
            /* Waveform data is stored delta-encoded */
            let sample = &samples[samples_index as usize + j as usize];
            if sample.bits == 16 {
                let mut value = 0i16;
                for k in 0..sample.length as usize {
                    value = value.wrapping_add(r.u16_at(offset + (k << 1)) as i16);
                    samples_data.push(value);
                }
                offset = offset.saturating_add((sample.length as usize) << 1);
            } else {
                let mut value = 0i8;
                for k in 0..sample.length as usize {
                    value = value.wrapping_add(r.u8_at(offset + k) as i8);
                    samples_data.push(i16::from(value));
                }
                offset = offset.saturating_add(sample.length as usize);
            }
        }

        instruments.push(instr);
    }

    let module = XmModule {
        length,
        restart_position,
        num_channels,
        frequency_type,
        pattern_table,
        patterns: patterns.into_boxed_slice(),
        pattern_slots: pattern_slots.into_boxed_slice(),
        instruments: instruments.into_boxed_slice(),
        samples: samples.into_boxed_slice(),
        samples_data: samples_data.into_boxed_slice(),
        #[cfg(feature = "strings")]
        name,
        #[cfg(feature = "strings")]
        tracker_name,
    };
    Ok((module, tempo, bpm))
}

fn unpack_pattern(r: &Reader<'_>, offset: usize, packed_size: usize, slots: &mut [PatternSlot]) {
    let mut j = 0usize;
    let mut k = 0usize;
    while j < packed_size {
        /* The file may claim more slots than the pattern holds */
        let Some(slot) = slots.get_mut(k) else { break };
        let note = r.u8_at(offset + j);

        if note & 0x80 != 0 {
            /* MSB set: the low bits say which fields follow */
            j += 1;
            slot.note = if note & 1 != 0 {
                let n = r.u8_at(offset + j);
                j += 1;
                n
            } else {
                0
            };
            slot.instrument = if note & 2 != 0 {
                let n = r.u8_at(offset + j);
                j += 1;
                n
            } else {
                0
            };
            slot.volume_column = if note & 4 != 0 {
                let n = r.u8_at(offset + j);
                j += 1;
                n
            } else {
                0
            };
            slot.effect_type = if note & 8 != 0 {
                let n = r.u8_at(offset + j);
                j += 1;
                n
            } else {
                0
            };
            slot.effect_param = if note & 16 != 0 {
                let n = r.u8_at(offset + j);
                j += 1;
                n
            } else {
                0
            };
        } else {
            slot.note = note;
            slot.instrument = r.u8_at(offset + j + 1);
            slot.volume_column = r.u8_at(offset + j + 2);
            slot.effect_type = r.u8_at(offset + j + 3);
            slot.effect_param = r.u8_at(offset + j + 4);
            j += 5;
        }

        slot.note = sanitize_note(slot.note);
        k += 1;
    }
}

fn load_envelope(
    r: &Reader<'_>,
    points_offset: usize,
    num_points: u8,
    sustain_point: u8,
    loop_start_point: u8,
    loop_end_point: u8,
    flags: u8,
) -> Envelope {
    let mut env = Envelope {
        points: ArrayVec::new(),
        sustain_point,
        loop_start_point,
        loop_end_point,
        flags: EnvelopeFlags::from_bits_truncate(flags),
    };

    for j in 0..usize::from(num_points).min(MAX_ENVELOPE_POINTS) {
        let frame = r.u16_at(points_offset + 4 * j);
        /* The on-disk value is 16 bits wide but only 0..=64 is meaningful */
        let value = (r.u16_at(points_offset + 4 * j + 2) as u8).min(MAX_ENVELOPE_VALUE);
        if let Some(prev) = env.points.last() {
            /* Point frames must be strictly increasing */
            if frame <= prev.frame {
                break;
            }
        }
        env.points.push(EnvelopePoint { frame, value });
    }

    let num_points = env.points.len() as u8;
    if num_points < 2 {
        env.flags.remove(EnvelopeFlags::ENABLED);
    }
    if num_points > 0 {
        env.sustain_point = env.sustain_point.min(num_points - 1);
        env.loop_start_point = env.loop_start_point.min(num_points - 1);
        env.loop_end_point = env.loop_end_point.min(num_points - 1);
    } else {
        env.sustain_point = 0;
        env.loop_start_point = 0;
        env.loop_end_point = 0;
    }
    env
}

fn check_sanity_postload(module: &mut XmModule) -> Result<(), LoadError> {
    /* Check the POT */
    let mut i = 0u16;
    while i < module.length {
        let entry = module.pattern_table[i as usize];
        if usize::from(entry) >= module.patterns.len() {
            if i + 1 == module.length && module.length > 1 {
                /* Cheap fix, observed in real modules */
                warn!("trimming invalid pattern order table entry at position {:#04X}", i);
                module.length -= 1;
            } else {
                return Err(LoadError::Invalid(
                    "pattern order table references a nonexistent pattern",
                ));
            }
        }
        i += 1;
    }

    /* Unused tail entries are unreachable by playback but keep them
       pointing at a real pattern anyway */
    for entry in module.pattern_table[module.length as usize..].iter_mut() {
        *entry = 0;
    }
    Ok(())
}
