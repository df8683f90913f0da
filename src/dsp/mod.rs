pub const TWO_PI: f32 = 2.0 * std::f32::consts::PI;

/// Keep an accumulated phase inside [0, 2π) so long-running oscillators do
/// not lose precision. Called once per block, not per sample.
pub fn wrap_phase(phase: f32) -> f32 {
    let p = phase % TWO_PI;
    if p < 0.0 {
        p + TWO_PI
    } else {
        p
    }
}

/// Triangle wave from an accumulated phase, peak ±1.
pub fn triangle(phase: f32) -> f32 {
    let t = wrap_phase(phase) / TWO_PI;
    if t < 0.25 {
        4.0 * t
    } else if t < 0.75 {
        2.0 - 4.0 * t
    } else {
        4.0 * t - 4.0
    }
}

/// Stereo placement by attenuating the far channel. A pan of -0.5 leaves the
/// left channel untouched and halves the right channel.
pub fn pan_attenuate(sample: f32, pan: f32) -> (f32, f32) {
    let pan = pan.clamp(-1.0, 1.0);
    if pan > 0.0 {
        (sample * (1.0 - pan), sample)
    } else {
        (sample, sample * (1.0 + pan))
    }
}

/// Equal-power crossfade gains for a progress ratio in [0, 1].
pub fn crossfade_gains(progress: f32) -> (f32, f32) {
    let theta = progress.clamp(0.0, 1.0) * std::f32::consts::FRAC_PI_2;
    (theta.cos(), theta.sin())
}

/// Linear fade-in/out applied to both edges of an interleaved stereo buffer
/// to prevent clicks at loop boundaries.
pub fn apply_edge_fades(samples: &mut [f32], fade_frames: usize) {
    let frames = samples.len() / 2;
    let fade = fade_frames.min(frames / 2);
    for i in 0..fade {
        let gain = i as f32 / fade as f32;
        samples[i * 2] *= gain;
        samples[i * 2 + 1] *= gain;
        let j = frames - 1 - i;
        samples[j * 2] *= gain;
        samples[j * 2 + 1] *= gain;
    }
}

/// Sample-counted linear gain ramp. A new target replaces any ramp still in
/// flight, always starting from the current value rather than the old target.
#[derive(Debug, Clone)]
pub struct LinearRamp {
    current: f32,
    target: f32,
    remaining: u32,
}

impl LinearRamp {
    pub fn hold(value: f32) -> Self {
        Self {
            current: value,
            target: value,
            remaining: 0,
        }
    }

    pub fn ramp_to(&mut self, target: f32, frames: u32) {
        self.target = target;
        self.remaining = frames.max(1);
    }

    /// Advance one frame and return the new value.
    pub fn next(&mut self) -> f32 {
        if self.remaining > 0 {
            let step = (self.target - self.current) / self.remaining as f32;
            self.current += step;
            self.remaining -= 1;
            if self.remaining == 0 {
                self.current = self.target;
            }
        }
        self.current
    }

    pub fn value(&self) -> f32 {
        self.current
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn is_settled(&self) -> bool {
        self.remaining == 0
    }
}

/// Block peak limiter: rescales the whole block whenever its peak exceeds
/// the threshold.
#[derive(Debug, Clone, Copy)]
pub struct SoftLimiter {
    pub threshold: f32,
}

impl SoftLimiter {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn process(&self, buffer: &mut [f32]) {
        let mut max_val = 0.0f32;
        for &s in buffer.iter() {
            if s.abs() > max_val {
                max_val = s.abs();
            }
        }
        if max_val > self.threshold {
            let norm = self.threshold / max_val;
            for v in buffer.iter_mut() {
                *v *= norm;
            }
        }
    }
}
