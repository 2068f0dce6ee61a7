//! Occlusion heuristic.
//!
//! A permission dialog renders as a large flat card near the centre of the
//! screen. Sampling a grid around the centre pixel and counting how many
//! samples share its colour separates that case from real content well
//! enough; mistakes are absorbed by the session's retry budget.

use stillcap_core::{ClassifierConfig, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Likely real screen content.
    Valid,
    /// Likely covered by a dialog overlay.
    Suspect,
}

/// Verdict plus the sample counts that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub verdict: Verdict,
    /// In-bounds grid samples, the centre included.
    pub samples: u32,
    /// Samples within `uniform_threshold` of the centre colour.
    pub uniform: u32,
}

impl Classification {
    pub fn uniform_ratio(&self) -> f64 {
        self.uniform as f64 / self.samples.max(1) as f64
    }
}

/// Classify `frame`. Pure: same bytes and config, same answer.
pub fn classify(frame: &Frame, config: &ClassifierConfig) -> Classification {
    let (width, height) = (frame.width() as i64, frame.height() as i64);
    let (cx, cy) = (width / 2, height / 2);
    let centre = frame.rgb_at(cx as u32, cy as u32);

    let half = config.half_window as i64;
    let stride = config.stride.max(1) as usize;

    let mut samples = 0u32;
    let mut uniform = 0u32;
    for dy in (-half..=half).step_by(stride) {
        let y = cy + dy;
        if y < 0 || y >= height {
            continue;
        }
        for dx in (-half..=half).step_by(stride) {
            let x = cx + dx;
            if x < 0 || x >= width {
                continue;
            }
            samples += 1;
            let pixel = frame.rgb_at(x as u32, y as u32);
            let distance: u32 = pixel
                .iter()
                .zip(centre.iter())
                .map(|(a, b)| a.abs_diff(*b) as u32)
                .sum();
            if distance < config.uniform_threshold {
                uniform += 1;
            }
        }
    }

    let result = Classification { verdict: Verdict::Valid, samples, uniform };
    let verdict = if result.uniform_ratio() >= config.suspect_ratio {
        Verdict::Suspect
    } else {
        Verdict::Valid
    };
    Classification { verdict, ..result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use stillcap_capture::scripted::frames;
    use stillcap_core::PixelFormat;

    fn white_with_black_columns(size: u32, columns: &[u32]) -> Frame {
        let mut data = Vec::with_capacity((size * size * 4) as usize);
        for _y in 0..size {
            for x in 0..size {
                let v = if columns.contains(&x) { 0 } else { 255 };
                data.extend_from_slice(&[v, v, v, 255]);
            }
        }
        Frame::packed(Bytes::from(data), size, size, PixelFormat::Rgba8888).unwrap()
    }

    #[test]
    fn flat_frame_is_suspect() {
        let c = classify(&frames::solid(400, 800, [250, 250, 250, 255]), &ClassifierConfig::default());
        assert_eq!(c.verdict, Verdict::Suspect);
        assert_eq!(c.samples, 121);
        assert_eq!(c.uniform, 121);
    }

    #[test]
    fn checkerboard_is_valid() {
        let c = classify(&frames::checkerboard(400, 800, 10), &ClassifierConfig::default());
        assert_eq!(c.verdict, Verdict::Valid);
        assert!(c.uniform_ratio() < 0.6, "ratio={}", c.uniform_ratio());
    }

    #[test]
    fn ratio_at_threshold_is_suspect() {
        // 5×5 grid around (25, 25); blacking out column x=5 spoils exactly 5 samples.
        let config = ClassifierConfig { half_window: 20, ..Default::default() };

        let at_threshold = classify(&white_with_black_columns(50, &[5]), &config);
        assert_eq!((at_threshold.samples, at_threshold.uniform), (25, 20));
        assert_eq!(at_threshold.verdict, Verdict::Suspect);

        let below = classify(&white_with_black_columns(50, &[5, 15]), &config);
        assert_eq!(below.uniform, 15);
        assert_eq!(below.verdict, Verdict::Valid);
    }

    fn banded(step: [u8; 3]) -> Frame {
        // Rows alternate every 10 px between grey 200 and `step`; centre row is grey.
        let mut data = Vec::new();
        for y in 0..40u32 {
            for _x in 0..40u32 {
                let [r, g, b] = if (y / 10) % 2 == 1 { step } else { [200, 200, 200] };
                data.extend_from_slice(&[r, g, b, 255]);
            }
        }
        Frame::packed(Bytes::from(data), 40, 40, PixelFormat::Rgba8888).unwrap()
    }

    #[test]
    fn distance_threshold_is_exclusive() {
        let config = ClassifierConfig::default();

        // |209-200| + |209-200| + |210-200| = 28 < 30: every sample is uniform.
        let close = classify(&banded([209, 209, 210]), &config);
        assert_eq!((close.samples, close.uniform), (16, 16));
        assert_eq!(close.verdict, Verdict::Suspect);

        // 30 is not below the threshold: half the samples differ.
        let apart = classify(&banded([210, 210, 210]), &config);
        assert_eq!(apart.uniform, 8);
        assert_eq!(apart.verdict, Verdict::Valid);
    }

    #[test]
    fn window_is_clipped_to_small_frames() {
        let c = classify(&frames::solid(30, 30, [0, 0, 0, 255]), &ClassifierConfig::default());
        // Centre 15: only offsets -10, 0 and 10 land inside a 30 px axis.
        assert_eq!(c.samples, 9);
        assert_eq!(c.verdict, Verdict::Suspect);
    }

    #[test]
    fn row_padding_is_never_sampled() {
        // Flat pixels, noisy padding bytes: still a flat frame.
        let (w, h, row_stride) = (120u32, 120u32, 120 * 4 + 32);
        let mut data = Vec::with_capacity((row_stride * h) as usize);
        for y in 0..h {
            for _ in 0..w {
                data.extend_from_slice(&[90, 120, 200, 255]);
            }
            data.extend((0..32).map(|i| ((y * 31 + i * 97) % 256) as u8));
        }
        let frame = Frame::new(Bytes::from(data), w, h, 4, row_stride, PixelFormat::Rgba8888).unwrap();
        assert_eq!(classify(&frame, &ClassifierConfig::default()).verdict, Verdict::Suspect);
    }

    #[test]
    fn classification_is_deterministic() {
        let frame = frames::checkerboard(333, 517, 7);
        let config = ClassifierConfig::default();
        let first = classify(&frame, &config);
        for _ in 0..10 {
            assert_eq!(classify(&frame, &config), first);
        }
    }
}
