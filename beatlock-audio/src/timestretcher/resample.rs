//! Linear-interpolation resampler
//!
//! Reads the input at a fractional position that advances by the playback
//! rate per output frame. Pitch follows the rate; there is no latency and no
//! lookahead beyond the next input frame.

use super::{QualityMode, StretchInput, StretchStrategy, TaggedFrame};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct LinearResampler {
    /// Read position relative to the front of the input queue
    position: f64,
}

impl LinearResampler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StretchStrategy for LinearResampler {
    fn produce(
        &mut self,
        input: &mut StretchInput,
        rate: f64,
        max_frames: usize,
        out: &mut VecDeque<TaggedFrame>,
    ) -> usize {
        if input.is_empty() {
            return 0;
        }
        let mut produced = 0;

        while produced < max_frames {
            let index = self.position.floor() as usize;
            let frac = self.position - index as f64;

            // An integral position needs only its own frame
            let needed = if frac == 0.0 { index + 1 } else { index + 2 };
            if input.len() < needed {
                break;
            }

            let (l0, r0) = input.frame(index);
            let (left, right) = if frac == 0.0 {
                (l0, r0)
            } else {
                let (l1, r1) = input.frame(index + 1);
                let t = frac as f32;
                (l0 + (l1 - l0) * t, r0 + (r1 - r0) * t)
            };
            out.push_back(TaggedFrame { left, right, rate });
            produced += 1;

            self.position += rate;
            let done = (self.position.floor() as usize).min(input.len());
            input.discard(done);
            self.position -= done as f64;
        }

        produced
    }

    fn reset(&mut self) {
        self.position = 0.0;
    }

    fn latency_frames(&self) -> usize {
        0
    }

    fn mode(&self) -> QualityMode {
        QualityMode::Fallback
    }
}
