//! Per-batch signal conditioning applied before samples reach a ring buffer.
//!
//! Every stored batch is brought to the same sampling rate and has its mean
//! removed, so buffers from different instruments plot on a common footing.

use crate::model::SampleBatch;

/// Resample `batch` to `target_rate` and remove its mean.
pub fn condition(batch: &SampleBatch, target_rate: f64) -> SampleBatch {
    let mut out = resample(batch, target_rate);
    demean(&mut out.values);
    out
}

/// Linear-interpolation resampling onto a grid starting at `batch.start`.
///
/// Downsampling first smooths with a boxcar as wide as the decimation ratio.
/// The output holds `round(n * target / source)` samples.
pub fn resample(batch: &SampleBatch, target_rate: f64) -> SampleBatch {
    let source_rate = batch.sampling_rate;
    if batch.values.is_empty()
        || target_rate <= 0.0
        || source_rate <= 0.0
        || (source_rate - target_rate).abs() < 1e-9
    {
        return batch.clone();
    }

    let ratio = source_rate / target_rate;
    let smoothed;
    let source: &[f64] = if ratio > 1.0 {
        smoothed = boxcar(&batch.values, ratio.round() as usize);
        &smoothed
    } else {
        &batch.values
    };

    let n_out = ((source.len() as f64) / ratio).round().max(1.0) as usize;
    let last = source.len() - 1;
    let values = (0..n_out)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            if idx >= last {
                return source[last];
            }
            let frac = pos - idx as f64;
            source[idx] + frac * (source[idx + 1] - source[idx])
        })
        .collect();

    SampleBatch {
        channel: batch.channel.clone(),
        start: batch.start,
        sampling_rate: target_rate,
        values,
    }
}

/// Subtract the arithmetic mean in place.
pub fn demean(values: &mut [f64]) {
    if values.is_empty() {
        return;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    for v in values.iter_mut() {
        *v -= mean;
    }
}

fn boxcar(values: &[f64], width: usize) -> Vec<f64> {
    if width <= 1 {
        return values.to_vec();
    }
    let half = width / 2;
    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + width - half).min(values.len());
            values[lo..hi].iter().sum::<f64>() / (hi - lo) as f64
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChannelId;
    use chrono::Utc;

    fn batch(rate: f64, values: Vec<f64>) -> SampleBatch {
        SampleBatch {
            channel: ChannelId::new("NET", "STA", "", "BHZ"),
            start: Utc::now(),
            sampling_rate: rate,
            values,
        }
    }

    #[test]
    fn test_same_rate_keeps_length() {
        let input = batch(25.0, (0..40).map(f64::from).collect());
        let out = condition(&input, 25.0);
        assert_eq!(out.values.len(), 40);
        assert_eq!(out.sampling_rate, 25.0);
    }

    #[test]
    fn test_demean_zero_mean() {
        let input = batch(25.0, vec![10.0, 12.0, 14.0, 16.0]);
        let out = condition(&input, 25.0);
        let mean: f64 = out.values.iter().sum::<f64>() / out.values.len() as f64;
        assert!(mean.abs() < 1e-12);
        assert_eq!(out.values, vec![-3.0, -1.0, 1.0, 3.0]);
    }

    #[test]
    fn test_downsample_halves_count() {
        let input = batch(100.0, vec![1.0; 200]);
        let out = resample(&input, 50.0);
        assert_eq!(out.values.len(), 100);
        assert!(out.values.iter().all(|v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_upsample_interpolates() {
        let input = batch(1.0, vec![0.0, 2.0, 4.0]);
        let out = resample(&input, 2.0);
        assert_eq!(out.values.len(), 6);
        assert_eq!(&out.values[..5], &[0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(out.values[5], 4.0);
    }
}
