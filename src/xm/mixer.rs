//! The sample mixer: per-channel sample advance, loop resolution,
//! interpolation, ramping and the stereo sum.
#[cfg(any(feature = "ramping", feature = "linear-interpolation"))]
use super::effects::lerp;
#[cfg(feature = "ramping")]
use super::effects::slide_towards;
use super::*;

/// Normalised value of one stored sample point.
pub(crate) fn sample_at(module: &XmModule, sample: &Sample, k: u32) -> f32 {
    debug_assert!(k < sample.length);
    let point = module.samples_data[(sample.data_index + k) as usize];
    if sample.bits == 16 {
        f32::from(point) / f32::from(i16::MAX)
    } else {
        f32::from(point) / f32::from(i8::MAX)
    }
}

/// Draws the next point of the channel's sample stream, advancing the
/// sample position and resolving the sample's loop. Detaches the sample
/// once a non-looping sample has played through.
pub(crate) fn next_of_sample(module: &XmModule, ch: &mut ChannelState) -> f32 {
    let (Some(_), Some(sample_index)) = (ch.instrument, ch.sample) else {
        #[cfg(feature = "ramping")]
        if (ch.frame_count as usize) < RAMPING_POINTS {
            return lerp(
                ch.end_of_previous_sample[ch.frame_count as usize],
                0.0,
                ch.frame_count as f32 / RAMPING_POINTS as f32,
            );
        }
        return 0.0;
    };
    let smp = module.sample(sample_index);
    if smp.length == 0 {
        return 0.0;
    }

    let mut a = ch.sample_position as u32;
    #[cfg(feature = "linear-interpolation")]
    let t = ch.sample_position - a as f32;
    ch.sample_position += ch.step;

    let b: u32;
    match smp.loop_type {
        LoopType::None => {
            if ch.sample_position >= smp.length as f32 {
                /* The sample is done playing */
                ch.sample = None;
                b = a;
            } else {
                b = if a + 1 < smp.length { a + 1 } else { a };
            }
        }

        LoopType::Forward => {
            /* If length=6, loop_start=2, loop_end=6:
               0 1 (2 3 4 5) (2 3 4 5) (2 3 4 5) ... */
            while ch.sample_position >= smp.loop_end as f32 {
                ch.sample_position -= smp.loop_length as f32;
            }
            b = if a + 1 == smp.loop_end {
                smp.loop_start
            } else {
                a + 1
            };
        }

        LoopType::PingPong => {
            /* If length=6, loop_start=2, loop_end=6:
               0 1 (2 3 4 5 5 4 3 2) (2 3 4 5 5 4 3 2) ... */
            while ch.sample_position >= (smp.loop_end + smp.loop_length) as f32 {
                ch.sample_position -= (smp.loop_length * 2) as f32;
            }

            if a < smp.loop_end {
                /* First half of the loop, go forwards */
                b = if a + 1 == smp.loop_end { a } else { a + 1 };
            } else {
                /* Second half, reflect and go backwards:
                   loop_end -> loop_end - 1, ...,
                   loop_end + loop_length - 1 -> loop_start */
                let reflected = (2 * i64::from(smp.loop_end) - 1 - i64::from(a))
                    .clamp(i64::from(smp.loop_start), i64::from(smp.loop_end) - 1);
                a = reflected as u32;
                b = if a == smp.loop_start { a } else { a - 1 };
            }
        }
    }

    /* A sample switch that kept the old position may point past the new
       sample; treat it like the C CHECK guards and stay in bounds */
    let a = a.min(smp.length - 1);
    #[cfg(feature = "linear-interpolation")]
    let b = b.min(smp.length - 1);
    #[cfg(not(feature = "linear-interpolation"))]
    let _ = b;

    let mut u = sample_at(module, smp, a);

    #[cfg(feature = "linear-interpolation")]
    {
        u = lerp(u, sample_at(module, smp, b), t);
    }

    #[cfg(feature = "ramping")]
    if (ch.frame_count as usize) < RAMPING_POINTS {
        /* Smoothly transition between the old and the new sample */
        u = lerp(
            ch.end_of_previous_sample[ch.frame_count as usize],
            u,
            ch.frame_count as f32 / RAMPING_POINTS as f32,
        );
    }

    u
}

impl XmContext {
    /// One stereo contribution of one channel, with ramping bookkeeping.
    pub(crate) fn next_of_channel(&mut self, ci: usize) -> [f32; 2] {
        let ch = &mut self.channels[ci];
        let fval = next_of_sample(&self.module, ch) * self.amplification;

        let silent = ch.muted
            || ch
                .instrument
                .is_some_and(|i| self.instrument_muted[i as usize])
            || (self.max_loop_count > 0 && self.loop_count >= self.max_loop_count);

        let mut out = [0.0f32; 2];
        if !silent {
            out[0] = fval * ch.actual_volume[0];
            out[1] = fval * ch.actual_volume[1];
        }

        #[cfg(feature = "ramping")]
        {
            ch.frame_count += 1;
            slide_towards(&mut ch.actual_volume[0], ch.target_volume[0], self.volume_ramp);
            slide_towards(&mut ch.actual_volume[1], ch.target_volume[1], self.volume_ramp);
        }

        out
    }

    /// One summed stereo frame.
    pub(crate) fn sample_mixed(&mut self, out: &mut [f32]) {
        if self.remaining_samples_in_tick <= 0.0 {
            self.tick();
        }
        self.remaining_samples_in_tick -= 1.0;

        out[0] = 0.0;
        out[1] = 0.0;
        for ci in 0..self.channels.len() {
            let pair = self.next_of_channel(ci);
            out[0] += pair[0];
            out[1] += pair[1];
        }

        out[0] = out[0].clamp(-1.0, 1.0);
        out[1] = out[1].clamp(-1.0, 1.0);
    }

    /// One frame of per-channel stereo pairs, without the sum.
    pub(crate) fn sample_unmixed(&mut self, out: &mut [f32]) {
        if self.remaining_samples_in_tick <= 0.0 {
            self.tick();
        }
        self.remaining_samples_in_tick -= 1.0;

        for ci in 0..self.channels.len() {
            let pair = self.next_of_channel(ci);
            out[2 * ci] = pair[0].clamp(-1.0, 1.0);
            out[2 * ci + 1] = pair[1].clamp(-1.0, 1.0);
        }
    }
}
