//! Test-only builder that writes minimal XM 1.04 byte images.
use super::*;

pub(crate) const XM_ENVELOPE_ON: u8 = 0x1;
#[allow(dead_code)]
pub(crate) const XM_ENVELOPE_SUSTAIN: u8 = 0x2;
#[allow(dead_code)]
pub(crate) const XM_ENVELOPE_LOOP: u8 = 0x4;

pub(crate) fn slot(note: u8, instrument: u8, volume: u8, effect: u8, param: u8) -> [u8; 5] {
    [note, instrument, volume, effect, param]
}

pub(crate) fn note_on(note: u8, instrument: u8) -> [u8; 5] {
    slot(note, instrument, 0, 0, 0)
}

pub(crate) fn effect(effect_type: u8, param: u8) -> [u8; 5] {
    slot(0, 0, 0, effect_type, param)
}

pub(crate) struct TestPattern {
    rows: u16,
    slots: Vec<(u16, u16, [u8; 5])>,
    packed_override: Option<Vec<u8>>,
}

impl TestPattern {
    pub(crate) fn set(&mut self, row: u16, channel: u16, slot: [u8; 5]) -> &mut TestPattern {
        self.slots.push((row, channel, slot));
        self
    }

    /// Use raw packed pattern data instead of the builder's uncompressed
    /// encoding.
    #[allow(dead_code)]
    pub(crate) fn packed(&mut self, data: Vec<u8>) -> &mut TestPattern {
        self.packed_override = Some(data);
        self
    }
}

#[derive(Clone)]
pub(crate) struct TestSample {
    /// PCM values; for 8-bit samples only the low byte range is used.
    pcm: Vec<i16>,
    bits: u8,
    loop_flag: u8,
    loop_start: u32,
    loop_length: u32,
    volume: u8,
    panning: u8,
    finetune: i8,
    relative_note: i8,
}

impl TestSample {
    pub(crate) fn from_8bit(pcm: &[i8]) -> TestSample {
        TestSample {
            pcm: pcm.iter().map(|&v| i16::from(v)).collect(),
            bits: 8,
            loop_flag: 0,
            loop_start: 0,
            loop_length: 0,
            volume: MAX_VOLUME,
            panning: 128,
            finetune: 0,
            relative_note: 0,
        }
    }

    pub(crate) fn from_16bit(pcm: &[i16]) -> TestSample {
        TestSample {
            bits: 16,
            ..TestSample::from_8bit(&[])
        }
        .with_pcm(pcm)
    }

    fn with_pcm(mut self, pcm: &[i16]) -> TestSample {
        self.pcm = pcm.to_vec();
        self
    }

    /// An audible 8-bit ramp of `length` points.
    pub(crate) fn ramp_8bit(length: u32) -> TestSample {
        let pcm: Vec<i8> = (0..length).map(|k| (k % 100) as i8).collect();
        TestSample::from_8bit(&pcm)
    }

    /// Loop window in sample points.
    pub(crate) fn looped(mut self, loop_type: LoopType, start: u32, length: u32) -> TestSample {
        self.loop_flag = match loop_type {
            LoopType::None => 0,
            LoopType::Forward => 1,
            LoopType::PingPong => 2,
        };
        self.loop_start = start;
        self.loop_length = length;
        self
    }

    #[allow(dead_code)]
    pub(crate) fn volume(mut self, volume: u8) -> TestSample {
        self.volume = volume;
        self
    }

    #[allow(dead_code)]
    pub(crate) fn panning(mut self, panning: u8) -> TestSample {
        self.panning = panning;
        self
    }

    #[allow(dead_code)]
    pub(crate) fn relative_note(mut self, relative_note: i8) -> TestSample {
        self.relative_note = relative_note;
        self
    }
}

pub(crate) struct TestInstrument {
    samples: Vec<TestSample>,
    sample_of_notes: [u8; NUM_NOTES as usize],
    vol_env: Vec<(u16, u8)>,
    vol_flags: u8,
    vol_sustain: u8,
    vol_loop_start: u8,
    vol_loop_end: u8,
    pan_env: Vec<(u16, u8)>,
    pan_flags: u8,
    fadeout: u16,
    vibrato: (u8, u8, u8, u8),
}

impl TestInstrument {
    pub(crate) fn sample(&mut self, sample: TestSample) -> &mut TestInstrument {
        self.samples.push(sample);
        self
    }

    pub(crate) fn volume_envelope(
        &mut self,
        points: &[(u16, u8)],
        flags: u8,
        sustain: u8,
        loop_start: u8,
        loop_end: u8,
    ) -> &mut TestInstrument {
        self.vol_env = points.to_vec();
        self.vol_flags = flags;
        self.vol_sustain = sustain;
        self.vol_loop_start = loop_start;
        self.vol_loop_end = loop_end;
        self
    }

    #[allow(dead_code)]
    pub(crate) fn fadeout(&mut self, fadeout: u16) -> &mut TestInstrument {
        self.fadeout = fadeout;
        self
    }

    /// Raw on-disk autovibrato bytes (type before the loader's remap).
    pub(crate) fn autovibrato(
        &mut self,
        vibrato_type: u8,
        sweep: u8,
        depth: u8,
        rate: u8,
    ) -> &mut TestInstrument {
        self.vibrato = (vibrato_type, sweep, depth, rate);
        self
    }
}

pub(crate) struct ModuleBuilder {
    channels: u16,
    tempo: u16,
    bpm: u16,
    restart: u16,
    linear: bool,
    order: Option<Vec<u8>>,
    patterns: Vec<TestPattern>,
    instruments: Vec<TestInstrument>,
}

impl ModuleBuilder {
    pub(crate) fn new(channels: u16) -> ModuleBuilder {
        ModuleBuilder {
            channels,
            tempo: 6,
            bpm: 125,
            restart: 0,
            linear: true,
            order: None,
            patterns: Vec::new(),
            instruments: Vec::new(),
        }
    }

    #[allow(dead_code)]
    pub(crate) fn tempo(&mut self, tempo: u16) -> &mut ModuleBuilder {
        self.tempo = tempo;
        self
    }

    #[allow(dead_code)]
    pub(crate) fn bpm(&mut self, bpm: u16) -> &mut ModuleBuilder {
        self.bpm = bpm;
        self
    }

    #[allow(dead_code)]
    pub(crate) fn amiga(&mut self) -> &mut ModuleBuilder {
        self.linear = false;
        self
    }

    #[allow(dead_code)]
    pub(crate) fn restart(&mut self, position: u16) -> &mut ModuleBuilder {
        self.restart = position;
        self
    }

    pub(crate) fn order(&mut self, entries: &[u8]) -> &mut ModuleBuilder {
        self.order = Some(entries.to_vec());
        self
    }

    pub(crate) fn pattern(&mut self, rows: u16) -> &mut TestPattern {
        self.patterns.push(TestPattern {
            rows,
            slots: Vec::new(),
            packed_override: None,
        });
        self.patterns.last_mut().unwrap()
    }

    pub(crate) fn instrument(&mut self) -> &mut TestInstrument {
        self.instruments.push(TestInstrument {
            samples: Vec::new(),
            sample_of_notes: [0; NUM_NOTES as usize],
            vol_env: Vec::new(),
            vol_flags: 0,
            vol_sustain: 0,
            vol_loop_start: 0,
            vol_loop_end: 0,
            pan_env: Vec::new(),
            pan_flags: 0,
            fadeout: 0,
            vibrato: (0, 0, 0, 0),
        });
        self.instruments.last_mut().unwrap()
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"Extended Module: ");
        out.extend_from_slice(&[0x20; 20]);
        out.push(0x1A);
        out.extend_from_slice(&[0x20; 20]);
        out.extend_from_slice(&[0x04, 0x01]);

        /* Module header */
        let order = self.order.clone().unwrap_or_else(|| vec![0]);
        w32(&mut out, 20 + PATTERN_ORDER_TABLE_LENGTH as u32);
        w16(&mut out, order.len() as u16);
        w16(&mut out, self.restart);
        w16(&mut out, self.channels);
        w16(&mut out, self.patterns.len() as u16);
        w16(&mut out, self.instruments.len() as u16);
        w16(&mut out, u16::from(self.linear));
        w16(&mut out, self.tempo);
        w16(&mut out, self.bpm);
        let mut pot = [0u8; PATTERN_ORDER_TABLE_LENGTH];
        pot[..order.len()].copy_from_slice(&order);
        out.extend_from_slice(&pot);

        for pattern in &self.patterns {
            let packed = match &pattern.packed_override {
                Some(data) => data.clone(),
                None if pattern.slots.is_empty() => Vec::new(),
                None => {
                    let mut grid =
                        vec![[0u8; 5]; pattern.rows as usize * self.channels as usize];
                    for &(row, channel, slot) in &pattern.slots {
                        grid[row as usize * self.channels as usize + channel as usize] =
                            slot;
                    }
                    grid.concat()
                }
            };
            w32(&mut out, 9);
            out.push(0);
            w16(&mut out, pattern.rows);
            w16(&mut out, packed.len() as u16);
            out.extend_from_slice(&packed);
        }

        for instr in &self.instruments {
            if instr.samples.is_empty() {
                w32(&mut out, 29);
                out.extend_from_slice(&[0u8; 22]);
                out.push(0);
                w16(&mut out, 0);
                continue;
            }

            w32(&mut out, 263);
            out.extend_from_slice(&[0u8; 22]);
            out.push(0);
            w16(&mut out, instr.samples.len() as u16);
            w32(&mut out, 40);
            out.extend_from_slice(&instr.sample_of_notes);
            for j in 0..MAX_ENVELOPE_POINTS {
                let &(frame, value) = instr.vol_env.get(j).unwrap_or(&(0, 0));
                w16(&mut out, frame);
                w16(&mut out, u16::from(value));
            }
            for j in 0..MAX_ENVELOPE_POINTS {
                let &(frame, value) = instr.pan_env.get(j).unwrap_or(&(0, 0));
                w16(&mut out, frame);
                w16(&mut out, u16::from(value));
            }
            out.push(instr.vol_env.len() as u8);
            out.push(instr.pan_env.len() as u8);
            out.push(instr.vol_sustain);
            out.push(instr.vol_loop_start);
            out.push(instr.vol_loop_end);
            out.push(0);
            out.push(0);
            out.push(0);
            out.push(instr.vol_flags);
            out.push(instr.pan_flags);
            out.push(instr.vibrato.0);
            out.push(instr.vibrato.1);
            out.push(instr.vibrato.2);
            out.push(instr.vibrato.3);
            w16(&mut out, instr.fadeout);
            out.extend_from_slice(&[0u8; 22]);

            for sample in &instr.samples {
                let point_bytes = u32::from(sample.bits / 8);
                w32(&mut out, sample.pcm.len() as u32 * point_bytes);
                w32(&mut out, sample.loop_start * point_bytes);
                w32(&mut out, sample.loop_length * point_bytes);
                out.push(sample.volume);
                out.push(sample.finetune as u8);
                out.push(sample.loop_flag | if sample.bits == 16 { 0x10 } else { 0 });
                out.push(sample.panning);
                out.push(sample.relative_note as u8);
                out.push(0);
                out.extend_from_slice(&[0u8; 22]);
            }

            for sample in &instr.samples {
                if sample.bits == 16 {
                    let mut prev = 0i16;
                    for &value in &sample.pcm {
                        w16(&mut out, value.wrapping_sub(prev) as u16);
                        prev = value;
                    }
                } else {
                    let mut prev = 0i8;
                    for &value in &sample.pcm {
                        out.push((value as i8).wrapping_sub(prev) as u8);
                        prev = value as i8;
                    }
                }
            }
        }

        out
    }
}

fn w16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn w32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}
