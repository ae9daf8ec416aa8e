//! Small numeric helpers shared by the identifiers.

/// Least-squares slope of a point cloud.
///
/// Deviations are taken from the means so large time stamps do not eat the
/// precision of the fit. Returns `None` with fewer than two points or when all
/// x values coincide.
pub fn least_squares_slope<I>(points: I) -> Option<f64>
where
    I: IntoIterator<Item = (f64, f64)>,
    I::IntoIter: Clone,
{
    let iter = points.into_iter();
    let (n, sum_x, sum_y) = iter
        .clone()
        .fold((0usize, 0.0f64, 0.0f64), |(n, sx, sy), (x, y)| (n + 1, sx + x, sy + y));
    if n < 2 {
        return None;
    }
    let mean_x = sum_x / n as f64;
    let mean_y = sum_y / n as f64;

    let (sxy, sxx) = iter.fold((0.0f64, 0.0f64), |(sxy, sxx), (x, y)| {
        let dx = x - mean_x;
        (sxy + dx * (y - mean_y), sxx + dx * dx)
    });
    if sxx <= f64::EPSILON {
        return None;
    }
    Some(sxy / sxx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_slope_of_line() {
        let pts = [(1000.0, 3.0), (1001.0, 5.0), (1002.0, 7.0), (1003.0, 9.0)];
        let slope = least_squares_slope(pts.iter().copied()).unwrap();
        assert_abs_diff_eq!(slope, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(least_squares_slope([(1.0, 1.0)]).is_none());
        assert!(least_squares_slope([(2.0, 1.0), (2.0, 5.0)]).is_none());
    }
}
