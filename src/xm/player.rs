//! The sequencer: row and tick dispatch, note and instrument handling,
//! and the public generate operations.
use super::effects::*;
#[cfg(feature = "ramping")]
use super::mixer::next_of_sample;
use super::*;

/// `Rxy` volume transforms, indexed by the x nibble.
const MULTI_RETRIG_ADD: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 4, 8, 16, 0, 0];
const MULTI_RETRIG_SUB: [u8; 16] = [0, 1, 2, 4, 8, 16, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
const MULTI_RETRIG_MUL: [u8; 16] = [1, 1, 1, 1, 1, 1, 2, 1, 1, 1, 1, 1, 1, 1, 3, 2];
const MULTI_RETRIG_DIV: [u8; 16] = [1, 1, 1, 1, 1, 1, 3, 2, 1, 1, 1, 1, 1, 1, 2, 1];

fn cut_note(ch: &mut ChannelState) {
    /* NB: this is not the same as a key off */
    ch.volume = 0;
}

fn key_off(module: &XmModule, ch: &mut ChannelState) {
    ch.sustained = false;

    /* If no volume envelope is used, also cut the note */
    let has_volume_envelope = ch
        .instrument
        .is_some_and(|i| module.instrument(i).volume_envelope.flags.is_enabled());
    if !has_volume_envelope {
        cut_note(ch);
    }
}

impl XmContext {
    /// Renders interleaved stereo frames into `output`, a `[L, R, L, R,
    /// ...]` buffer of `2 · frames` values in `[-1, 1]`. Advances the
    /// playback state by `output.len() / 2` frames.
    pub fn generate_samples(&mut self, output: &mut [f32]) {
        self.generated_samples += (output.len() / 2) as u64;
        for out in output.chunks_exact_mut(2) {
            self.sample_mixed(out);
        }
    }

    /// Renders per-channel stereo frames without summing them: each frame
    /// is `2 · num_channels` values laid out `[ch0_L, ch0_R, ch1_L,
    /// ch1_R, ...]`. Advances the playback state by `output.len() / (2 ·
    /// num_channels)` frames.
    pub fn generate_samples_unmixed(&mut self, output: &mut [f32]) {
        let frame_len = 2 * self.module.num_channels as usize;
        if frame_len == 0 {
            return;
        }
        self.generated_samples += (output.len() / frame_len) as u64;
        for out in output.chunks_exact_mut(frame_len) {
            self.sample_unmixed(out);
        }
    }

    pub(crate) fn tick(&mut self) {
        if self.current_tick == 0 {
            self.row();
        }

        for ci in 0..self.channels.len() {
            self.channel_tick(ci);
        }

        self.current_tick = self.current_tick.wrapping_add(1);
        if self.current_tick >= u16::from(self.tempo) + self.extra_ticks {
            self.current_tick = 0;
            self.extra_ticks = 0;
        }

        /* FT2 manual says number of ticks / second = BPM * 0.4 */
        self.remaining_samples_in_tick += f32::from(self.rate) / (f32::from(self.bpm) * 0.4);
    }

    fn post_pattern_change(&mut self) {
        /* Loop if necessary */
        if u16::from(self.current_table_index) >= self.module.length {
            self.current_table_index = self.module.restart_position as u8;
        }
    }

    fn row(&mut self) {
        if self.position_jump {
            /* A position jump overrides a pattern break */
            self.current_table_index = self.jump_dest;
            self.current_row = self.jump_row;
            self.position_jump = false;
            self.pattern_break = false;
            self.jump_row = 0;
            self.post_pattern_change();
        } else if self.pattern_break {
            self.current_table_index = self.current_table_index.wrapping_add(1);
            self.current_row = self.jump_row;
            self.pattern_break = false;
            self.jump_row = 0;
            self.post_pattern_change();
        }

        let pattern_index = self.module.pattern_table[self.current_table_index as usize];
        let pattern = self.module.patterns[pattern_index as usize];
        /* A break may target a row the pattern does not have */
        if u16::from(self.current_row) >= pattern.num_rows {
            self.current_row = 0;
        }
        let slot_base = pattern.slots_index as usize
            + self.module.num_channels as usize * self.current_row as usize;

        let mut in_a_loop = false;
        for ci in 0..self.channels.len() {
            let slot = self.module.pattern_slots[slot_base + ci];
            self.channels[ci].current = slot;

            if slot.effect_type != 0x0E || slot.effect_param >> 4 != 0x0D {
                self.handle_note_and_instrument(ci);
            } else {
                /* EDy: defer note and instrument handling */
                self.channels[ci].note_delay_param = slot.effect_param & 0x0F;
            }

            if self.channels[ci].pattern_loop_count > 0 {
                in_a_loop = true;
            }
        }

        if !in_a_loop {
            /* No E6y loop is in effect (or we are in the first pass).
               Playing a row a second time is what "the module looped"
               means. */
            let index = MAX_ROWS_PER_PATTERN as usize * self.current_table_index as usize
                + self.current_row as usize;
            self.loop_count = self.row_loop_count[index];
            self.row_loop_count[index] = self.row_loop_count[index].wrapping_add(1);
        }

        /* This u8 increment can wrap from 255 to 0, in which case it is
           still necessary to go to the next pattern */
        self.current_row = self.current_row.wrapping_add(1);
        if !self.position_jump
            && !self.pattern_break
            && (u16::from(self.current_row) >= pattern.num_rows || self.current_row == 0)
        {
            self.current_table_index = self.current_table_index.wrapping_add(1);
            /* current_row is 0 most of the time, except when E60 is used */
            self.current_row = self.jump_row;
            self.jump_row = 0;
            self.post_pattern_change();
        }
    }

    /// Row-entry handling of one slot: instrument switch, note trigger or
    /// key off, volume column, effect column. Also invoked at the target
    /// tick of an `EDy` note delay.
    fn handle_note_and_instrument(&mut self, ci: usize) {
        let slot = self.channels[ci].current;
        let frequency_type = self.module.frequency_type;

        if slot.instrument > 0 {
            let has_instrument = self.channels[ci].instrument.is_some();
            let has_sample = self.channels[ci].sample.is_some();
            if slot.has_tone_portamento() && has_instrument && has_sample {
                /* Tone portamento in effect, unclear stuff happens */
                self.trigger_note(
                    ci,
                    TriggerFlags::KEEP_PERIOD | TriggerFlags::KEEP_SAMPLE_POSITION,
                );
            } else if slot.note == 0 && has_sample {
                /* Ghost instrument: sample position is kept, envelopes
                   are reset */
                self.trigger_note(ci, TriggerFlags::KEEP_SAMPLE_POSITION);
            } else if usize::from(slot.instrument) > self.module.instruments.len() {
                /* Invalid instrument, cut the current note */
                cut_note(&mut self.channels[ci]);
                self.channels[ci].instrument = None;
                self.channels[ci].sample = None;
            } else {
                self.channels[ci].instrument = Some(u16::from(slot.instrument) - 1);
            }
        }

        if note_is_key_off(slot.note) {
            key_off(&self.module, &mut self.channels[ci]);
        } else if slot.note != 0 {
            /* The real note number is slot.note - 1, a quirk the format
               documentation never spells out */
            let instrument = self.channels[ci].instrument;
            let has_sample = self.channels[ci].sample.is_some();

            if slot.has_tone_portamento() && instrument.is_some() && has_sample {
                let sample = self.module.sample(self.channels[ci].sample.unwrap());
                let note = f32::from(slot.note)
                    + f32::from(sample.relative_note)
                    + f32::from(sample.finetune) / 128.0
                    - 1.0;
                let ch = &mut self.channels[ci];
                ch.note = note;
                ch.tone_portamento_target_period = period(frequency_type, note);
            } else {
                match instrument {
                    Some(ii) if self.module.instrument(ii).num_samples > 0 => {
                        #[cfg(feature = "ramping")]
                        {
                            /* Snapshot the old stream for the cross-fade */
                            for z in 0..RAMPING_POINTS {
                                let value =
                                    next_of_sample(&self.module, &mut self.channels[ci]);
                                self.channels[ci].end_of_previous_sample[z] = value;
                            }
                            self.channels[ci].frame_count = 0;
                        }

                        let instr = self.module.instrument(ii);
                        let sample_index = instr.samples_index
                            + u16::from(instr.sample_of_notes[usize::from(slot.note) - 1]);
                        let sample = self.module.sample(sample_index);
                        let note = f32::from(slot.note)
                            + f32::from(sample.relative_note)
                            + f32::from(sample.finetune) / 128.0
                            - 1.0;
                        let ch = &mut self.channels[ci];
                        ch.sample = Some(sample_index);
                        ch.orig_note = note;
                        ch.note = note;
                        if slot.instrument > 0 {
                            self.trigger_note(ci, TriggerFlags::empty());
                        } else {
                            /* Ghost note: keep the old volume */
                            self.trigger_note(ci, TriggerFlags::KEEP_VOLUME);
                        }
                    }
                    _ => {
                        /* Bad instrument */
                        cut_note(&mut self.channels[ci]);
                    }
                }
            }
        }

        match slot.volume_column >> 4 {
            0x5 if slot.volume_column > 0x50 => {}
            0x1..=0x5 => {
                /* Set volume */
                self.channels[ci].volume = slot.volume_column - 0x10;
            }
            0x8 => {
                /* Fine volume slide down */
                param_slide(
                    &mut self.channels[ci].volume,
                    slot.volume_column & 0x0F,
                    u16::from(MAX_VOLUME),
                );
            }
            0x9 => {
                /* Fine volume slide up */
                param_slide(
                    &mut self.channels[ci].volume,
                    slot.volume_column << 4,
                    u16::from(MAX_VOLUME),
                );
            }
            0xA => {
                /* Set vibrato speed */
                let ch = &mut self.channels[ci];
                ch.vibrato_param =
                    (ch.vibrato_param & 0x0F) | ((slot.volume_column & 0x0F) << 4);
            }
            0xC => {
                /* Set panning */
                self.channels[ci].panning = (slot.volume_column & 0x0F) * 0x11;
            }
            0xF => {
                /* Tone portamento */
                if slot.volume_column & 0x0F != 0 {
                    self.channels[ci].tone_portamento_param =
                        (slot.volume_column & 0x0F) * 0x11;
                }
            }
            _ => {}
        }

        match slot.effect_type {
            1 => {
                /* 1xx: Portamento up */
                if slot.effect_param > 0 {
                    self.channels[ci].portamento_up_param = slot.effect_param;
                }
            }

            2 => {
                /* 2xx: Portamento down */
                if slot.effect_param > 0 {
                    self.channels[ci].portamento_down_param = slot.effect_param;
                }
            }

            3 => {
                /* 3xx: Tone portamento */
                if slot.effect_param > 0 {
                    self.channels[ci].tone_portamento_param = slot.effect_param;
                }
            }

            4 => {
                /* 4xy: Vibrato */
                let ch = &mut self.channels[ci];
                if slot.effect_param & 0x0F != 0 {
                    /* Set vibrato depth */
                    ch.vibrato_param = (ch.vibrato_param & 0xF0) | (slot.effect_param & 0x0F);
                }
                if slot.effect_param >> 4 != 0 {
                    /* Set vibrato speed */
                    ch.vibrato_param = (slot.effect_param & 0xF0) | (ch.vibrato_param & 0x0F);
                }
            }

            5 | 6 | 0xA => {
                /* 5xy: Tone portamento + volume slide,
                   6xy: Vibrato + volume slide, Axy: Volume slide */
                if slot.effect_param > 0 {
                    self.channels[ci].volume_slide_param = slot.effect_param;
                }
            }

            7 => {
                /* 7xy: Tremolo */
                let ch = &mut self.channels[ci];
                if slot.effect_param & 0x0F != 0 {
                    /* Set tremolo depth */
                    ch.tremolo_param = (ch.tremolo_param & 0xF0) | (slot.effect_param & 0x0F);
                }
                if slot.effect_param >> 4 != 0 {
                    /* Set tremolo speed */
                    ch.tremolo_param = (slot.effect_param & 0xF0) | (ch.tremolo_param & 0x0F);
                }
            }

            8 => {
                /* 8xx: Set panning */
                self.channels[ci].panning = slot.effect_param;
            }

            9 => {
                /* 9xx: Sample offset, ignored unless a note is present */
                if self.channels[ci].sample.is_some() && note_is_valid(slot.note) {
                    let ch = &mut self.channels[ci];
                    if slot.effect_param > 0 {
                        ch.sample_offset_param = slot.effect_param;
                    }
                    ch.sample_position += f32::from(ch.sample_offset_param) * 256.0;
                    let loop_end = self.module.sample(ch.sample.unwrap()).loop_end;
                    if ch.sample_position >= loop_end as f32 {
                        /* Pretend the sample doesn't loop and is done
                           playing */
                        ch.sample = None;
                    }
                }
            }

            0xB => {
                /* Bxx: Position jump */
                if u16::from(slot.effect_param) < self.module.length {
                    self.position_jump = true;
                    self.jump_dest = slot.effect_param;
                    self.jump_row = 0;
                }
            }

            0xC => {
                /* Cxx: Set volume */
                self.channels[ci].volume = slot.effect_param.min(MAX_VOLUME);
            }

            0xD => {
                /* Dxx: Pattern break, jump after playing this line */
                self.pattern_break = true;
                self.jump_row = (slot.effect_param >> 4) * 10 + (slot.effect_param & 0x0F);
            }

            0x0E => self.extended_effect_row(ci, slot),

            0x0F => {
                /* Fxx: Set tempo/BPM */
                if slot.effect_param > 0 {
                    if slot.effect_param <= 0x1F {
                        self.tempo = slot.effect_param;
                    } else {
                        self.bpm = slot.effect_param;
                    }
                }
            }

            16 => {
                /* Gxx: Set global volume */
                self.global_volume = slot.effect_param.min(MAX_VOLUME);
            }

            17 => {
                /* Hxy: Global volume slide */
                if slot.effect_param > 0 {
                    self.channels[ci].global_volume_slide_param = slot.effect_param;
                }
            }

            21 => {
                /* Lxx: Set envelope position */
                let ch = &mut self.channels[ci];
                ch.volume_envelope_frame_count = u16::from(slot.effect_param);
                ch.panning_envelope_frame_count = u16::from(slot.effect_param);
            }

            25 => {
                /* Pxy: Panning slide */
                if slot.effect_param > 0 {
                    self.channels[ci].panning_slide_param = slot.effect_param;
                }
            }

            27 => {
                /* Rxy: Multi retrig note */
                if slot.effect_param > 0 {
                    let ch = &mut self.channels[ci];
                    if slot.effect_param >> 4 == 0 {
                        /* Keep the previous x value */
                        ch.multi_retrig_param =
                            (ch.multi_retrig_param & 0xF0) | (slot.effect_param & 0x0F);
                    } else {
                        ch.multi_retrig_param = slot.effect_param;
                    }
                }
            }

            29 => {
                /* Txy: Tremor. Unlike Rxy the x and y params are not
                   separately remembered */
                if slot.effect_param > 0 {
                    self.channels[ci].tremor_param = slot.effect_param;
                }
            }

            33 => {
                /* Xxy: Extra fine portamento */
                match slot.effect_param >> 4 {
                    1 => {
                        let offset = {
                            let ch = &mut self.channels[ci];
                            if slot.effect_param & 0x0F != 0 {
                                ch.extra_fine_portamento_up_param = slot.effect_param & 0x0F;
                            }
                            ch.extra_fine_portamento_up_param
                        };
                        pitch_slide(
                            frequency_type,
                            self.rate,
                            &mut self.channels[ci],
                            -f32::from(offset),
                        );
                    }
                    2 => {
                        let offset = {
                            let ch = &mut self.channels[ci];
                            if slot.effect_param & 0x0F != 0 {
                                ch.extra_fine_portamento_down_param =
                                    slot.effect_param & 0x0F;
                            }
                            ch.extra_fine_portamento_down_param
                        };
                        pitch_slide(
                            frequency_type,
                            self.rate,
                            &mut self.channels[ci],
                            f32::from(offset),
                        );
                    }
                    _ => {}
                }
            }

            _ => {}
        }
    }

    /// Row-entry part of the `EXy` extended commands.
    fn extended_effect_row(&mut self, ci: usize, slot: PatternSlot) {
        let frequency_type = self.module.frequency_type;
        match slot.effect_param >> 4 {
            0x1 => {
                /* E1y: Fine portamento up */
                let offset = {
                    let ch = &mut self.channels[ci];
                    if slot.effect_param & 0x0F != 0 {
                        ch.fine_portamento_up_param = slot.effect_param & 0x0F;
                    }
                    ch.fine_portamento_up_param
                };
                pitch_slide(
                    frequency_type,
                    self.rate,
                    &mut self.channels[ci],
                    -f32::from(offset),
                );
            }

            0x2 => {
                /* E2y: Fine portamento down */
                let offset = {
                    let ch = &mut self.channels[ci];
                    if slot.effect_param & 0x0F != 0 {
                        ch.fine_portamento_down_param = slot.effect_param & 0x0F;
                    }
                    ch.fine_portamento_down_param
                };
                pitch_slide(
                    frequency_type,
                    self.rate,
                    &mut self.channels[ci],
                    f32::from(offset),
                );
            }

            0x4 => {
                /* E4y: Set vibrato control */
                self.channels[ci].vibrato_control_param = slot.effect_param;
            }

            0x5 => {
                /* E5y: Set finetune */
                if note_is_valid(slot.note) && self.channels[ci].sample.is_some() {
                    let relative_note = self
                        .module
                        .sample(self.channels[ci].sample.unwrap())
                        .relative_note;
                    let note = f32::from(slot.note)
                        + f32::from(relative_note)
                        + ((i32::from(slot.effect_param & 0x0F) - 8) << 4) as f32 / 128.0
                        - 1.0;
                    let ch = &mut self.channels[ci];
                    ch.note = note;
                    ch.period = period(frequency_type, note);
                    update_frequency(frequency_type, self.rate, ch);
                }
            }

            0x6 => {
                /* E6y: Pattern loop */
                if slot.effect_param & 0x0F != 0 {
                    if slot.effect_param & 0x0F == self.channels[ci].pattern_loop_count {
                        /* The loop is over */
                        self.channels[ci].pattern_loop_count = 0;
                    } else {
                        /* Jump to the beginning of the loop */
                        self.channels[ci].pattern_loop_count += 1;
                        self.position_jump = true;
                        self.jump_row = self.channels[ci].pattern_loop_origin;
                        self.jump_dest = self.current_table_index;
                    }
                } else {
                    /* Set the loop start point */
                    let origin = self.current_row;
                    self.channels[ci].pattern_loop_origin = origin;
                    /* Replicate the FT2 E60 bug */
                    self.jump_row = origin;
                }
            }

            0x7 => {
                /* E7y: Set tremolo control */
                self.channels[ci].tremolo_control_param = slot.effect_param;
            }

            0xA => {
                /* EAy: Fine volume slide up */
                let ch = &mut self.channels[ci];
                if slot.effect_param & 0x0F != 0 {
                    ch.fine_volume_slide_param = (slot.effect_param & 0x0F) << 4;
                }
                let raw = ch.fine_volume_slide_param;
                param_slide(&mut ch.volume, raw, u16::from(MAX_VOLUME));
            }

            0xB => {
                /* EBy: Fine volume slide down */
                let ch = &mut self.channels[ci];
                if slot.effect_param & 0x0F != 0 {
                    ch.fine_volume_slide_param = slot.effect_param & 0x0F;
                }
                let raw = ch.fine_volume_slide_param;
                param_slide(&mut ch.volume, raw, u16::from(MAX_VOLUME));
            }

            0xD => {
                /* EDy: Note delay retrigger. EDy triggers even without a
                   note or instrument, but only ED0 acts like a ghost
                   note. */
                if slot.note == 0 && slot.instrument == 0 {
                    if slot.effect_param & 0x0F != 0 {
                        let orig_note = self.channels[ci].orig_note;
                        self.channels[ci].note = orig_note;
                        self.trigger_note(ci, TriggerFlags::KEEP_VOLUME);
                    } else {
                        self.trigger_note(
                            ci,
                            TriggerFlags::KEEP_VOLUME
                                | TriggerFlags::KEEP_PERIOD
                                | TriggerFlags::KEEP_SAMPLE_POSITION,
                        );
                    }
                }
            }

            0xE => {
                /* EEy: Pattern delay */
                self.extra_ticks +=
                    u16::from(slot.effect_param & 0x0F) * u16::from(self.tempo);
            }

            _ => {}
        }
    }

    /// Per-tick effect processing of one channel, including the final
    /// volume/panning law of this tick.
    fn channel_tick(&mut self, ci: usize) {
        let frequency_type = self.module.frequency_type;
        let rate = self.rate;
        let slot = self.channels[ci].current;

        envelopes(&self.module, &mut self.channels[ci]);
        if let Some(instrument) = self.channels[ci].instrument {
            autovibrato(
                self.module.instrument(instrument),
                frequency_type,
                rate,
                &mut self.next_rand,
                &mut self.channels[ci],
            );
        }

        {
            let ch = &mut self.channels[ci];
            if ch.should_reset_arpeggio && !ch.current.has_arpeggio() {
                ch.should_reset_arpeggio = false;
                ch.arp_note_offset = 0;
                update_frequency(frequency_type, rate, ch);
            }
            if ch.should_reset_vibrato && !ch.current.has_vibrato() {
                ch.should_reset_vibrato = false;
                ch.vibrato_note_offset = 0;
                update_frequency(frequency_type, rate, ch);
            }
        }

        if self.current_tick > 0 {
            match slot.volume_column >> 4 {
                0x6 => {
                    /* Volume slide down */
                    param_slide(
                        &mut self.channels[ci].volume,
                        slot.volume_column & 0x0F,
                        u16::from(MAX_VOLUME),
                    );
                }

                0x7 => {
                    /* Volume slide up */
                    param_slide(
                        &mut self.channels[ci].volume,
                        slot.volume_column << 4,
                        u16::from(MAX_VOLUME),
                    );
                }

                0xB => {
                    /* Vx: Vibrato. Does not reset pitch when the command
                       is discontinued */
                    let ch = &mut self.channels[ci];
                    ch.should_reset_vibrato = false;
                    vibrato(frequency_type, rate, &mut self.next_rand, ch);
                }

                0xD => {
                    /* Panning slide left */
                    param_slide(
                        &mut self.channels[ci].panning,
                        slot.volume_column & 0x0F,
                        MAX_PANNING,
                    );
                }

                0xE => {
                    /* Panning slide right */
                    param_slide(
                        &mut self.channels[ci].panning,
                        slot.volume_column << 4,
                        MAX_PANNING,
                    );
                }

                0xF => {
                    /* Mx: Tone portamento */
                    tone_portamento(frequency_type, rate, &mut self.channels[ci]);
                }

                _ => {}
            }
        }

        match slot.effect_type {
            0 => {
                /* 0xy: Arpeggio */
                if slot.effect_param != 0 {
                    let ch = &mut self.channels[ci];
                    ch.should_reset_arpeggio = true;
                    arpeggio(self.tempo, self.current_tick, frequency_type, rate, ch);
                }
            }

            1 => {
                /* 1xx: Portamento up */
                if self.current_tick != 0 {
                    let offset = self.channels[ci].portamento_up_param;
                    pitch_slide(
                        frequency_type,
                        rate,
                        &mut self.channels[ci],
                        -f32::from(offset),
                    );
                }
            }

            2 => {
                /* 2xx: Portamento down */
                if self.current_tick != 0 {
                    let offset = self.channels[ci].portamento_down_param;
                    pitch_slide(
                        frequency_type,
                        rate,
                        &mut self.channels[ci],
                        f32::from(offset),
                    );
                }
            }

            3 => {
                /* 3xx: Tone portamento */
                if self.current_tick != 0 {
                    tone_portamento(frequency_type, rate, &mut self.channels[ci]);
                }
            }

            4 => {
                /* 4xy: Vibrato */
                if self.current_tick != 0 {
                    let ch = &mut self.channels[ci];
                    ch.should_reset_vibrato = true;
                    vibrato(frequency_type, rate, &mut self.next_rand, ch);
                }
            }

            5 => {
                /* 5xy: Tone portamento + volume slide */
                if self.current_tick != 0 {
                    tone_portamento(frequency_type, rate, &mut self.channels[ci]);
                    let ch = &mut self.channels[ci];
                    let raw = ch.volume_slide_param;
                    param_slide(&mut ch.volume, raw, u16::from(MAX_VOLUME));
                }
            }

            6 => {
                /* 6xy: Vibrato + volume slide */
                if self.current_tick != 0 {
                    let ch = &mut self.channels[ci];
                    ch.should_reset_vibrato = true;
                    vibrato(frequency_type, rate, &mut self.next_rand, ch);
                    let ch = &mut self.channels[ci];
                    let raw = ch.volume_slide_param;
                    param_slide(&mut ch.volume, raw, u16::from(MAX_VOLUME));
                }
            }

            7 => {
                /* 7xy: Tremolo */
                if self.current_tick != 0 {
                    tremolo(&mut self.next_rand, &mut self.channels[ci]);
                }
            }

            0xA => {
                /* Axy: Volume slide */
                if self.current_tick != 0 {
                    let ch = &mut self.channels[ci];
                    let raw = ch.volume_slide_param;
                    param_slide(&mut ch.volume, raw, u16::from(MAX_VOLUME));
                }
            }

            0x0E => match slot.effect_param >> 4 {
                0x9 => {
                    /* E9y: Retrigger note */
                    if self.current_tick != 0 && slot.effect_param & 0x0F != 0 {
                        if self.current_tick % u16::from(slot.effect_param & 0x0F) == 0 {
                            self.trigger_note(ci, TriggerFlags::KEEP_VOLUME);
                            envelopes(&self.module, &mut self.channels[ci]);
                        }
                    }
                }

                0xC => {
                    /* ECy: Note cut */
                    if u16::from(slot.effect_param & 0x0F) == self.current_tick {
                        cut_note(&mut self.channels[ci]);
                    }
                }

                0xD => {
                    /* EDy: Note delay */
                    if u16::from(self.channels[ci].note_delay_param) == self.current_tick {
                        self.handle_note_and_instrument(ci);
                        envelopes(&self.module, &mut self.channels[ci]);
                    }
                }

                _ => {}
            },

            17 => {
                /* Hxy: Global volume slide */
                if self.current_tick != 0 {
                    let raw = self.channels[ci].global_volume_slide_param;
                    param_slide(&mut self.global_volume, raw, u16::from(MAX_VOLUME));
                }
            }

            20 => {
                /* Kxx: Key off. Most documentation will tell you the
                   parameter has no use; don't be fooled */
                if self.current_tick == u16::from(slot.effect_param) {
                    key_off(&self.module, &mut self.channels[ci]);
                }
            }

            25 => {
                /* Pxy: Panning slide */
                if self.current_tick != 0 {
                    let ch = &mut self.channels[ci];
                    let raw = ch.panning_slide_param;
                    param_slide(&mut ch.panning, raw, MAX_PANNING);
                }
            }

            27 => {
                /* Rxy: Multi retrig note */
                if self.current_tick != 0 {
                    self.multi_retrig_note(ci);
                }
            }

            29 => {
                /* Txy: Tremor */
                if self.current_tick != 0 {
                    let ch = &mut self.channels[ci];
                    let x = u16::from(ch.tremor_param >> 4);
                    let y = u16::from(ch.tremor_param & 0x0F);
                    ch.tremor_on = (self.current_tick - 1) % (x + y + 2) > x;
                }
            }

            _ => {}
        }

        /* Close the tick: compute the target volumes of both sides */
        let global_volume = self.global_volume;
        let ch = &mut self.channels[ci];

        let panning = i32::from(ch.panning)
            + (i32::from(ch.panning_envelope_panning) - i32::from(MAX_ENVELOPE_VALUE / 2))
                * (i32::from(MAX_PANNING / 2)
                    - (i32::from(ch.panning) - i32::from(MAX_PANNING / 2)).abs())
                / i32::from(MAX_ENVELOPE_VALUE / 2);

        let volume = if ch.tremor_on {
            0.0
        } else {
            /* 6 + 6 + 15 - 3 + 6 bits of range, scaled back to [0, 1) */
            let mut base =
                (i32::from(ch.volume) + i32::from(ch.tremolo_volume_offset)).clamp(0, 64);
            base *= i32::from(ch.volume_envelope_volume);
            base *= i32::from(ch.fadeout_volume);
            base /= 8;
            base *= i32::from(global_volume);
            base as f32 / 1_073_741_824.0
        };

        let left =
            volume * ((i32::from(MAX_PANNING) - panning) as f32 / f32::from(MAX_PANNING)).sqrt();
        let right = volume * (panning as f32 / f32::from(MAX_PANNING)).sqrt();

        #[cfg(feature = "ramping")]
        {
            ch.target_volume = [left, right];
        }
        #[cfg(not(feature = "ramping"))]
        {
            ch.actual_volume = [left, right];
        }
    }

    /// Retriggers the note on the current channel, resetting whatever
    /// `flags` does not ask to keep.
    fn trigger_note(&mut self, ci: usize, flags: TriggerFlags) {
        let sample_defaults = self.channels[ci]
            .sample
            .map(|si| {
                let sample = self.module.sample(si);
                (sample.volume, sample.panning)
            });
        let frequency_type = self.module.frequency_type;
        let rate = self.rate;
        let ch = &mut self.channels[ci];

        if !flags.contains(TriggerFlags::KEEP_SAMPLE_POSITION) {
            ch.sample_position = 0.0;
        }

        if let Some((volume, panning)) = sample_defaults {
            if !flags.contains(TriggerFlags::KEEP_VOLUME) {
                ch.volume = volume;
            }
            ch.panning = panning;
        }

        if !flags.contains(TriggerFlags::KEEP_ENVELOPE) {
            ch.sustained = true;
            ch.fadeout_volume = MAX_FADEOUT_VOLUME - 1;
            ch.volume_envelope_volume = MAX_VOLUME;
            ch.panning_envelope_panning = MAX_ENVELOPE_VALUE / 2;
            ch.volume_envelope_frame_count = 0;
            ch.panning_envelope_frame_count = 0;
        }

        ch.tremolo_volume_offset = 0;
        ch.tremor_on = false;
        ch.vibrato_note_offset = 0;
        ch.autovibrato_note_offset = 0;
        ch.autovibrato_ticks = 0;

        if ch.vibrato_control_param & 4 == 0 {
            ch.vibrato_ticks = 0;
        }
        if ch.tremolo_control_param & 4 == 0 {
            ch.tremolo_ticks = 0;
        }

        if !flags.contains(TriggerFlags::KEEP_PERIOD) {
            ch.period = period(frequency_type, ch.note);
            update_frequency(frequency_type, rate, ch);
        }
    }

    fn multi_retrig_note(&mut self, ci: usize) {
        let y = self.channels[ci].multi_retrig_param & 0x0F;
        if y == 0 || self.current_tick % u16::from(y) != 0 {
            return;
        }

        self.trigger_note(
            ci,
            TriggerFlags::KEEP_VOLUME | TriggerFlags::KEEP_ENVELOPE,
        );

        /* Rxy doesn't affect volume if there's a command in the volume
           column, or if the instrument has a volume envelope */
        let ch = &self.channels[ci];
        if ch.current.volume_column != 0 {
            return;
        }
        if ch
            .instrument
            .is_some_and(|i| self.module.instrument(i).volume_envelope.flags.is_enabled())
        {
            return;
        }

        let x = usize::from(self.channels[ci].multi_retrig_param >> 4);
        let ch = &mut self.channels[ci];
        let floor = ch.volume.max(MULTI_RETRIG_SUB[x]);
        let volume = (u16::from(floor) - u16::from(MULTI_RETRIG_SUB[x])
            + u16::from(MULTI_RETRIG_ADD[x]))
            * u16::from(MULTI_RETRIG_MUL[x])
            / u16::from(MULTI_RETRIG_DIV[x]);
        ch.volume = (volume as u8).min(MAX_VOLUME);
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::*;
    use super::*;
    use pretty_assertions::assert_eq;

    /* 8000 frames/s at 125 BPM = 160 frames per tick, exactly */
    const RATE: u16 = 8000;
    const TICK: usize = 160;

    fn generate(ctx: &mut XmContext, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; frames * 2];
        ctx.generate_samples(&mut out);
        out
    }

    fn simple_note_module() -> Vec<u8> {
        let mut builder = ModuleBuilder::new(2);
        builder.pattern(16).set(0, 0, note_on(61, 1));
        builder
            .instrument()
            .sample(TestSample::ramp_8bit(4000).looped(LoopType::Forward, 0, 4000));
        builder.build()
    }

    #[test]
    fn empty_module_generates_exact_silence() {
        let mut builder = ModuleBuilder::new(1);
        builder.pattern(64);
        let mut ctx = XmContext::load(&builder.build(), 44100).unwrap();

        let out = generate(&mut ctx, 9000);
        assert!(out.iter().all(|&v| v == 0.0));
        /* The cursor still advanced */
        assert!(ctx.position().2 > 0);
        assert_eq!(ctx.position().3, 9000);
    }

    #[test]
    fn generation_is_deterministic() {
        let data = simple_note_module();
        let mut a = XmContext::load(&data, RATE).unwrap();
        let mut b = XmContext::load(&data, RATE).unwrap();

        let out_a = generate(&mut a, 4096);
        let out_b = generate(&mut b, 4096);
        assert!(out_a.iter().zip(&out_b).all(|(x, y)| x.to_bits() == y.to_bits()));
        assert!(out_a.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn seek_to_origin_on_a_fresh_context_is_a_noop() {
        let data = simple_note_module();
        let mut a = XmContext::load(&data, RATE).unwrap();
        let mut b = XmContext::load(&data, RATE).unwrap();
        b.seek(0, 0, 0);

        let out_a = generate(&mut a, 2048);
        let out_b = generate(&mut b, 2048);
        assert!(out_a.iter().zip(&out_b).all(|(x, y)| x.to_bits() == y.to_bits()));
    }

    #[test]
    fn seek_moves_the_position_query() {
        let mut builder = ModuleBuilder::new(2);
        builder.pattern(8);
        builder.pattern(8);
        builder.order(&[0, 1, 1]);
        let mut ctx = XmContext::load(&builder.build(), RATE).unwrap();

        ctx.seek(2, 5, 0);
        let (pot, pattern, row, _) = ctx.position();
        assert_eq!((pot, pattern, row), (2, 1, 5));
    }

    #[test]
    fn note_trigger_sets_frequency_and_activity() {
        let data = simple_note_module();
        let mut ctx = XmContext::load(&data, RATE).unwrap();
        assert!(!ctx.is_channel_active(1));

        generate(&mut ctx, 1);
        assert!(ctx.is_channel_active(1));
        assert!(!ctx.is_channel_active(2));

        /* Note 61 == internal note 60, linear period 3840 */
        let expected = 8363.0 * ((4608.0f32 - 3840.0) / 768.0).exp2();
        assert_eq!(ctx.frequency_of_channel(1), expected);
    }

    #[test]
    fn portamento_up_slides_by_four_per_tick_in_linear_mode() {
        let mut builder = ModuleBuilder::new(2);
        {
            let pattern = builder.pattern(4);
            pattern.set(0, 0, note_on(61, 1));
            pattern.set(1, 0, effect(0x01, 0xFF));
        }
        builder
            .instrument()
            .sample(TestSample::ramp_8bit(60000).looped(LoopType::Forward, 0, 60000));
        let mut ctx = XmContext::load(&builder.build(), RATE).unwrap();

        /* Row 0 runs 6 ticks, then row 1 tick 0 (no slide yet), then one
           frame into tick 1 the first slide has happened */
        generate(&mut ctx, 7 * TICK + 1);
        let period = 3840.0 - 255.0 * 4.0;
        let expected = 8363.0 * ((4608.0f32 - period) / 768.0).exp2();
        assert_eq!(ctx.frequency_of_channel(1), expected);
    }

    #[test]
    fn pattern_delay_extends_the_row() {
        let mut builder = ModuleBuilder::new(1);
        {
            let pattern = builder.pattern(4);
            pattern.set(0, 0, effect(0x0E, 0xEE));
            pattern.set(1, 0, effect(0x08, 0xFF));
        }
        let mut ctx = XmContext::load(&builder.build(), RATE).unwrap();

        /* EEE at tempo 6: the row lasts 6 * (14 + 1) = 90 ticks */
        generate(&mut ctx, 90 * TICK);
        assert_eq!(ctx.panning_of_channel(1), 128.0 / 255.0);
        generate(&mut ctx, 1);
        assert_eq!(ctx.panning_of_channel(1), 1.0);
    }

    #[test]
    fn position_jump_with_pattern_break_targets_both() {
        let mut builder = ModuleBuilder::new(2);
        {
            let pattern = builder.pattern(16);
            pattern.set(0, 0, effect(0x0B, 0x02));
            pattern.set(0, 1, effect(0x0D, 0x10));
        }
        builder.pattern(16);
        builder.pattern(16);
        builder.order(&[0, 1, 2]);
        let mut ctx = XmContext::load(&builder.build(), RATE).unwrap();

        /* Row 0 plays its 6 ticks, then the jump is applied: POT index 2,
           row 10 (the row cursor has advanced past the processed row) */
        generate(&mut ctx, 6 * TICK + 1);
        let (pot, pattern, row, _) = ctx.position();
        assert_eq!((pot, pattern, row), (2, 2, 11));
    }

    #[test]
    fn loop_counter_counts_module_passes_and_then_silence() {
        let mut builder = ModuleBuilder::new(2);
        builder.tempo(1);
        builder.pattern(2).set(0, 0, note_on(61, 1));
        builder
            .instrument()
            .sample(TestSample::ramp_8bit(64).looped(LoopType::Forward, 0, 64));
        let mut ctx = XmContext::load(&builder.build(), RATE).unwrap();
        ctx.set_max_loop_count(1);

        /* Two rows at tempo 1, one tick each */
        generate(&mut ctx, 2 * TICK);
        assert_eq!(ctx.loop_count(), 0);

        generate(&mut ctx, 1);
        assert_eq!(ctx.loop_count(), 1);

        /* Past max_loop_count everything is exact zeroes */
        let out = generate(&mut ctx, 4 * TICK);
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn unmixed_channels_sum_to_the_mixed_output() {
        let mut builder = ModuleBuilder::new(2);
        {
            let pattern = builder.pattern(16);
            pattern.set(0, 0, note_on(61, 1));
            pattern.set(0, 1, note_on(49, 1));
        }
        builder
            .instrument()
            .sample(TestSample::ramp_8bit(8000).looped(LoopType::Forward, 0, 8000));
        let data = builder.build();

        let mut mixed_ctx = XmContext::load(&data, RATE).unwrap();
        let mut unmixed_ctx = XmContext::load(&data, RATE).unwrap();

        let frames = 2048;
        let mixed = generate(&mut mixed_ctx, frames);
        let mut unmixed = vec![0.0f32; frames * 4];
        unmixed_ctx.generate_samples_unmixed(&mut unmixed);

        for i in 0..frames {
            let left = unmixed[4 * i] + unmixed[4 * i + 2];
            let right = unmixed[4 * i + 1] + unmixed[4 * i + 3];
            assert_eq!(mixed[2 * i].to_bits(), left.to_bits());
            assert_eq!(mixed[2 * i + 1].to_bits(), right.to_bits());
        }
    }

    #[test]
    fn identical_channel_pairs_render_identically() {
        let mut builder = ModuleBuilder::new(2);
        {
            let pattern = builder.pattern(8);
            pattern.set(0, 0, note_on(61, 1));
            pattern.set(0, 1, note_on(61, 1));
            pattern.set(4, 0, slot(0, 0, 0x40, 0, 0));
            pattern.set(4, 1, slot(0, 0, 0x40, 0, 0));
        }
        builder
            .instrument()
            .sample(TestSample::ramp_8bit(8000).looped(LoopType::PingPong, 100, 4000));
        let mut ctx = XmContext::load(&builder.build(), RATE).unwrap();

        let mut out = vec![0.0f32; 512 * 4];
        while ctx.loop_count() == 0 {
            ctx.generate_samples_unmixed(&mut out);
            for frame in out.chunks_exact(4) {
                assert_eq!(frame[0].to_bits(), frame[2].to_bits());
                assert_eq!(frame[1].to_bits(), frame[3].to_bits());
            }
        }
    }

    #[test]
    fn note_delay_postpones_the_trigger() {
        let mut builder = ModuleBuilder::new(1);
        builder.pattern(4).set(0, 0, slot(61, 1, 0, 0x0E, 0xD3));
        builder
            .instrument()
            .sample(TestSample::ramp_8bit(8000).looped(LoopType::Forward, 0, 8000));
        let mut ctx = XmContext::load(&builder.build(), RATE).unwrap();

        /* Ticks 0..=2 have not triggered the note yet */
        generate(&mut ctx, 3 * TICK);
        assert!(!ctx.is_channel_active(1));

        /* Tick 3 does */
        generate(&mut ctx, 1);
        assert!(ctx.is_channel_active(1));
    }

    #[test]
    fn key_off_without_envelope_cuts_the_note() {
        let mut builder = ModuleBuilder::new(1);
        {
            let pattern = builder.pattern(4);
            pattern.set(0, 0, note_on(61, 1));
            pattern.set(1, 0, note_on(97, 0));
        }
        builder
            .instrument()
            .sample(TestSample::ramp_8bit(8000).looped(LoopType::Forward, 0, 8000));
        let mut ctx = XmContext::load(&builder.build(), RATE).unwrap();

        generate(&mut ctx, 1);
        assert_eq!(ctx.volume_of_channel(1), 1.0);

        /* Row 1 carries the key off */
        generate(&mut ctx, 6 * TICK);
        assert_eq!(ctx.volume_of_channel(1), 0.0);
    }

    #[test]
    fn set_volume_and_global_volume_queries() {
        let mut builder = ModuleBuilder::new(2);
        {
            let pattern = builder.pattern(4);
            pattern.set(0, 0, slot(61, 1, 0, 0x0C, 0x20));
            pattern.set(0, 1, effect(0x10, 0x20));
        }
        builder
            .instrument()
            .sample(TestSample::ramp_8bit(8000).looped(LoopType::Forward, 0, 8000));
        let mut ctx = XmContext::load(&builder.build(), RATE).unwrap();

        generate(&mut ctx, 1);
        /* Channel volume 32/64, global volume 32/64 */
        assert_eq!(ctx.volume_of_channel(1), 0.25);
        assert_eq!(ctx.instrument_of_channel(1), 1);
        assert_eq!(ctx.playing_speed(), (125, 6));
    }

    #[test]
    fn muted_channel_renders_zeroes_but_keeps_playing() {
        let data = simple_note_module();
        let mut ctx = XmContext::load(&data, RATE).unwrap();
        assert!(!ctx.mute_channel(1, true));
        assert!(ctx.mute_channel(1, true));

        let out = generate(&mut ctx, 1024);
        assert!(out.iter().all(|&v| v == 0.0));
        assert!(ctx.is_channel_active(1));

        assert!(ctx.mute_channel(1, false));
        let out = generate(&mut ctx, 1024);
        assert!(out.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn muted_instrument_renders_zeroes() {
        let data = simple_note_module();
        let mut ctx = XmContext::load(&data, RATE).unwrap();
        assert!(!ctx.mute_instrument(1, true));

        let out = generate(&mut ctx, 1024);
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn fxx_sets_tempo_and_bpm() {
        let mut builder = ModuleBuilder::new(2);
        {
            let pattern = builder.pattern(4);
            pattern.set(0, 0, effect(0x0F, 0x03));
            pattern.set(0, 1, effect(0x0F, 0xF0));
        }
        let mut ctx = XmContext::load(&builder.build(), RATE).unwrap();
        generate(&mut ctx, 1);
        assert_eq!(ctx.playing_speed(), (0xF0, 0x03));
    }
}
