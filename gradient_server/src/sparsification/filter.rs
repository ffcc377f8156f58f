use std::cmp::Ordering;

use super::RetentionRate;

/// Decides which coordinates of a buffer survive a sparsification pass.
///
/// Implementations must be deterministic, the same input and rate always select the same set.
pub trait SparseFilter: Send + Sync {
    /// Selects the coordinates to keep.
    ///
    /// # Arguments
    /// * `values` - The dense buffer being sparsified.
    /// * `rate` - The fraction to keep.
    ///
    /// # Returns
    /// The kept indices in ascending order.
    fn select(&self, values: &[f32], rate: RetentionRate) -> Vec<usize>;
}

/// Orders indices by descending magnitude, ties go to the lower index.
fn by_magnitude(values: &[f32]) -> impl Fn(&usize, &usize) -> Ordering {
    move |&a, &b| {
        values[b]
            .abs()
            .total_cmp(&values[a].abs())
            .then(a.cmp(&b))
    }
}

/// Returns how many of `len` coordinates `TopK` keeps, `ceil(len * rate)` clamped to `[1, len]`.
///
/// The product is taken in f64. When it lies within the f32 rounding error of `rate` from an
/// integer it snaps to that integer, so a rate of `0.4` keeps 2 out of 5 and not 3.
fn kept_len(len: usize, rate: RetentionRate) -> usize {
    if rate == RetentionRate::FULL {
        return len;
    }

    let exact = len as f64 * rate.get() as f64;
    let nearest = exact.round();
    let k = if (exact - nearest).abs() <= exact * f32::EPSILON as f64 {
        nearest
    } else {
        exact.ceil()
    };

    (k as usize).clamp(1, len)
}

/// Keeps the `ceil(len * rate)` coordinates with the largest magnitude.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopK;

impl SparseFilter for TopK {
    fn select(&self, values: &[f32], rate: RetentionRate) -> Vec<usize> {
        let len = values.len();
        if len == 0 {
            return Vec::new();
        }

        let k = kept_len(len, rate);
        let mut indices: Vec<usize> = (0..len).collect();

        if k < len {
            indices.select_nth_unstable_by(k - 1, by_magnitude(values));
            indices.truncate(k);
        }

        indices.sort_unstable();
        indices
    }
}

/// Keeps the largest coordinates until `rate` of the buffer's absolute mass is covered.
///
/// At full rate every non zero coordinate is kept, however small.
#[derive(Debug, Clone, Copy, Default)]
pub struct MagnitudeMass;

impl SparseFilter for MagnitudeMass {
    fn select(&self, values: &[f32], rate: RetentionRate) -> Vec<usize> {
        if rate == RetentionRate::FULL {
            return (0..values.len()).filter(|&i| values[i] != 0.).collect();
        }

        let total: f64 = values.iter().map(|x| x.abs() as f64).sum();
        if total == 0. {
            return Vec::new();
        }

        let target = total * rate.get() as f64;
        let mut indices: Vec<usize> = (0..values.len()).collect();
        indices.sort_unstable_by(by_magnitude(values));

        let mut mass = 0.;
        let mut kept = 0;

        for &i in &indices {
            if mass >= target {
                break;
            }

            mass += values[i].abs() as f64;
            kept += 1;
        }

        indices.truncate(kept);
        indices.sort_unstable();
        indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(r: f32) -> RetentionRate {
        RetentionRate::new(r).unwrap()
    }

    #[test]
    fn test_top_k_selects_largest() {
        let values = [0.1, -5., 0.3, 2., -0.2];
        assert_eq!(TopK.select(&values, rate(0.4)), vec![1, 3]);
    }

    #[test]
    fn test_top_k_keeps_at_least_one() {
        let values = [0.1, -5., 0.3];
        assert_eq!(TopK.select(&values, rate(0.01)), vec![1]);
    }

    #[test]
    fn test_top_k_ties_go_to_lower_index() {
        let values = [1., -1., 1., 1.];
        assert_eq!(TopK.select(&values, rate(0.5)), vec![0, 1]);
    }

    #[test]
    fn test_top_k_full_rate_keeps_everything() {
        let values = [0., 1., 0.];
        assert_eq!(TopK.select(&values, RetentionRate::FULL), vec![0, 1, 2]);
    }

    #[test]
    fn test_top_k_kept_len_past_f32_precision() {
        let len = (1 << 24) + 1;
        assert_eq!(kept_len(len, RetentionRate::FULL), len);
        assert_eq!(kept_len(len, rate(0.5)), (1 << 23) + 1);
        assert_eq!(kept_len(5, rate(0.4)), 2);
        assert_eq!(kept_len(3, rate(0.01)), 1);
    }

    #[test]
    fn test_top_k_empty() {
        assert!(TopK.select(&[], RetentionRate::FULL).is_empty());
    }

    #[test]
    fn test_magnitude_mass() {
        let values = [1., -6., 3.];
        assert_eq!(MagnitudeMass.select(&values, rate(0.5)), vec![1]);
        assert_eq!(MagnitudeMass.select(&values, rate(0.61)), vec![1, 2]);
        assert_eq!(MagnitudeMass.select(&values, RetentionRate::FULL), vec![0, 1, 2]);
    }

    #[test]
    fn test_magnitude_mass_full_rate_keeps_small_coordinates() {
        assert_eq!(MagnitudeMass.select(&[1e30, 1.], RetentionRate::FULL), vec![0, 1]);
        assert_eq!(MagnitudeMass.select(&[0., 2., 0.], RetentionRate::FULL), vec![1]);
    }

    #[test]
    fn test_magnitude_mass_all_zero() {
        assert!(MagnitudeMass.select(&[0.; 4], rate(0.5)).is_empty());
    }
}
