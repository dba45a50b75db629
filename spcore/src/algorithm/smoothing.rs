/// odd window length used for a requested moving-average window
#[inline]
pub fn odd_window(window: usize) -> usize {
    let window = window.max(1);
    if window % 2 == 0 { window + 1 } else { window }
}

/// moving-average smoothing in place, repeated `iterations` times
///
/// Even windows are widened by one. Near the edges the window is truncated and
/// the mean is taken over the points that exist.
pub fn smooth_vector_moving_average(v: &mut [f64], window: usize, iterations: usize) {
    let n = v.len();
    let half = odd_window(window) / 2;
    if n == 0 || half == 0 {
        return;
    }

    let mut prefix = vec![0.0f64; n + 1];
    for _ in 0..iterations {
        for i in 0..n {
            prefix[i + 1] = prefix[i] + v[i];
        }
        for (i, x) in v.iter_mut().enumerate() {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(n);
            *x = (prefix[hi] - prefix[lo]) / (hi - lo) as f64;
        }
    }
}

/// smoothed copy of `signal`; the input stays untouched
pub fn moving_average(signal: &[f64], window: usize, iterations: usize) -> Vec<f64> {
    let mut out = signal.to_vec();
    smooth_vector_moving_average(&mut out, window, iterations);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_odd_window() {
        assert_eq!(odd_window(0), 1);
        assert_eq!(odd_window(3), 3);
        assert_eq!(odd_window(4), 5);
    }

    #[test]
    fn test_moving_average_truncates_at_edges() {
        let smoothed = moving_average(&[3.0, 0.0, 0.0, 6.0], 3, 1);
        assert_relative_eq!(smoothed[0], 1.5);
        assert_relative_eq!(smoothed[1], 1.0);
        assert_relative_eq!(smoothed[2], 2.0);
        assert_relative_eq!(smoothed[3], 3.0);
    }

    #[test]
    fn test_even_window_widened() {
        let a = moving_average(&[0.0, 0.0, 9.0, 0.0, 0.0], 4, 1);
        let b = moving_average(&[0.0, 0.0, 9.0, 0.0, 0.0], 5, 1);
        assert_eq!(a, b);
        assert_relative_eq!(a[2], 1.8);
    }

    #[test]
    fn test_repeated_iterations_keep_constant_signal() {
        let smoothed = moving_average(&[2.0; 20], 5, 3);
        assert!(smoothed.iter().all(|&x| (x - 2.0).abs() < 1e-12));
        assert_eq!(moving_average(&[1.0, 5.0], 1, 4), vec![1.0, 5.0]);
        assert!(moving_average(&[], 3, 1).is_empty());
    }
}
