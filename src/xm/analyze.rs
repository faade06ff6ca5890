//! Reports which engine features a loaded module actually uses.
use core::fmt::Write;

use super::*;

impl XmContext {
    /// Reports which pattern effects, volume-column commands, envelope
    /// kinds and oscillator waveforms the loaded module uses, as a set of
    /// compiler defines understood by a size-optimised rebuild of the
    /// engine (a feature can be compiled out when its `DISABLED` bit is
    /// set).
    ///
    /// The output is ASCII and shorter than [ANALYZE_OUTPUT_SIZE] bytes.
    pub fn analyze(&self) -> String {
        let mut out = String::with_capacity(ANALYZE_OUTPUT_SIZE);
        let module = &self.module;

        out.push_str("-DXM_FREQUENCY_TYPES=");
        out.push_str(match module.frequency_type {
            FrequencyType::Linear => "1",
            FrequencyType::Amiga => "2",
        });

        let mut used_effects = 0u64;
        let mut used_volume_effects = 0u16;
        let mut used_waveforms = 0u16;
        let mut used_envelopes = 0u16;

        for slot in module.pattern_slots.iter() {
            if slot.effect_type == 0 {
                /* Do not count "000" as an arpeggio */
                if slot.effect_param != 0 {
                    used_effects |= 1;
                }
            } else if slot.effect_type < 64 {
                used_effects |= 1u64 << slot.effect_type;
            }

            used_volume_effects |= 1u16 << (slot.volume_column >> 4);

            if slot.effect_type == 0x0E {
                let sub = slot.effect_param >> 4;
                /* E4y and E7y select oscillator shapes */
                if sub == 0x4 || sub == 0x7 {
                    used_waveforms |= 1u16 << (slot.effect_param & 3);
                }
            }
        }

        for instr in module.instruments.iter() {
            if !instr.volume_envelope.points.is_empty() {
                used_envelopes |= 1;
            }
            if !instr.panning_envelope.points.is_empty() {
                used_envelopes |= 2;
            }
            if instr.volume_fadeout != 0 {
                used_envelopes |= 4;
            }
            if instr.vibrato_depth != 0
                && (instr.vibrato_rate > 0 || instr.vibrato_type == Waveform::Square)
            {
                used_envelopes |= 8;
                used_waveforms |= 1u16 << instr.vibrato_type as u8;
            }
        }

        let _ = write!(out, " -DXM_DISABLED_EFFECTS=0x{:016X}", !used_effects);
        let _ = write!(out, " -DXM_DISABLED_VOLUME_EFFECTS=0x{:04X}", !used_volume_effects);
        let _ = write!(out, " -DXM_DISABLED_ENVELOPES=0x{:04X}", !used_envelopes);
        let _ = write!(out, " -DXM_DISABLED_WAVEFORMS=0x{:04X}", !used_waveforms);

        debug_assert!(out.len() < ANALYZE_OUTPUT_SIZE);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::*;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_module_uses_nothing() {
        let mut builder = ModuleBuilder::new(2);
        builder.pattern(4);
        let ctx = XmContext::load(&builder.build(), 48000).unwrap();

        /* Empty slots still count volume-column nibble 0 */
        assert_eq!(
            ctx.analyze(),
            "-DXM_FREQUENCY_TYPES=1 \
             -DXM_DISABLED_EFFECTS=0xFFFFFFFFFFFFFFFF \
             -DXM_DISABLED_VOLUME_EFFECTS=0xFFFE \
             -DXM_DISABLED_ENVELOPES=0xFFFF \
             -DXM_DISABLED_WAVEFORMS=0xFFFF"
        );
        assert!(ctx.analyze().len() < ANALYZE_OUTPUT_SIZE);
    }

    #[test]
    fn effects_and_volume_columns_are_reported() {
        let mut builder = ModuleBuilder::new(2);
        {
            let pattern = builder.pattern(4);
            /* 1xx portamento, E43 square vibrato control, volume column
               set-volume (nibble 2) */
            pattern.set(0, 0, effect(0x01, 0x10));
            pattern.set(1, 0, effect(0x0E, 0x42));
            pattern.set(2, 1, slot(0, 0, 0x20, 0, 0));
        }
        builder.amiga();
        let ctx = XmContext::load(&builder.build(), 48000).unwrap();
        let report = ctx.analyze();

        assert!(report.starts_with("-DXM_FREQUENCY_TYPES=2 "));
        /* Effects 1 and 0x0E used: !(0b100000000000010) */
        let disabled_effects = !((1u64 << 1) | (1u64 << 0x0E));
        assert!(report.contains(&format!("-DXM_DISABLED_EFFECTS=0x{:016X}", disabled_effects)));
        /* Volume nibbles 0 and 2 used */
        assert!(report.contains(&format!(
            "-DXM_DISABLED_VOLUME_EFFECTS=0x{:04X}",
            !0b101u16
        )));
        /* E42 uses the square waveform (bit 2) */
        assert!(report.contains(&format!("-DXM_DISABLED_WAVEFORMS=0x{:04X}", !0b100u16)));
    }

    #[test]
    fn envelope_kinds_are_reported() {
        let mut builder = ModuleBuilder::new(2);
        builder.pattern(1);
        builder
            .instrument()
            .volume_envelope(&[(0, 64), (100, 0)], XM_ENVELOPE_ON, 0, 0, 0)
            .fadeout(500)
            .autovibrato(0, 0, 5, 3)
            .sample(TestSample::ramp_8bit(16));
        let ctx = XmContext::load(&builder.build(), 48000).unwrap();
        let report = ctx.analyze();

        /* Volume envelope (1), fadeout (4), autovibrato (8) with the sine
           waveform (bit 0) */
        assert!(report.contains(&format!("-DXM_DISABLED_ENVELOPES=0x{:04X}", !0b1101u16)));
        assert!(report.contains(&format!("-DXM_DISABLED_WAVEFORMS=0x{:04X}", !0b1u16)));
    }
}
