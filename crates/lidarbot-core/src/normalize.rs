use crate::domain::{FeatureVector, RangeFrame};

/// Reduce a frame to `width` integer-degree buckets scaled into `[-1, 1]`.
///
/// Each sample lands in `round(angle) mod width`; later samples overwrite
/// earlier ones in the same bucket. Buckets are rescaled against the largest
/// distance as `v / max * 2 - 1`, so empty buckets end up at -1 once anything
/// was seen. A frame whose largest distance is 0 leaves every bucket at 0.
///
/// Samples with a non-finite angle or a non-finite or negative distance are
/// ignored, which keeps the function total for any input.
pub fn normalize(frame: &RangeFrame, width: usize) -> FeatureVector {
    if width == 0 {
        return FeatureVector::zeros(0);
    }
    let mut buckets = vec![0.0f32; width];
    for s in frame.iter() {
        if !s.angle_deg.is_finite() || !s.distance_mm.is_finite() || s.distance_mm < 0.0 {
            continue;
        }
        buckets[bucket_index(s.angle_deg, width)] = s.distance_mm;
    }

    let max = buckets.iter().copied().fold(0.0f32, f32::max);
    if max > 0.0 {
        for v in buckets.iter_mut() {
            *v = ((*v / max) * 2.0 - 1.0).clamp(-1.0, 1.0);
        }
    }
    FeatureVector::from_values(buckets)
}

/// Bucket for an angle, wrapping negative and out-of-range angles.
pub fn bucket_index(angle_deg: f32, width: usize) -> usize {
    let rounded = angle_deg.round() as i64;
    rounded.rem_euclid(width as i64) as usize
}
