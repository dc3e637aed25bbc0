use tracing::{debug, info};

use crate::corpus::TestPosition;

/// Scaling factor, calibrated for the engine this tuner was first used with.
pub const K: f64 = 1.342224;

pub const DELTA_K: f64 = 0.0001_f64;

pub fn win_probability(score: i32, k: f64) -> f64 {
    1_f64 / (1_f64 + 10_f64.powf((-(score as f64) * k) / 400_f64))
}

pub fn squared_error(label: f64, score: i32, k: f64) -> f64 {
    (label - win_probability(score, k)).powi(2)
}

/// Mean squared error over the corpus, summed in corpus order.
pub fn mean_square_error(k: f64, positions: &[TestPosition]) -> f64 {
    let mut error = 0.0;
    for pos in positions {
        error += squared_error(pos.label, pos.score, k);
    }
    error / positions.len() as f64
}

/// Hill-climbs K in `delta` steps until neither neighbour lowers the error.
pub fn find_smallest_k(start: f64, delta: f64, positions: &[TestPosition]) -> f64 {
    let mut best_k = start;
    let mut best_e = mean_square_error(best_k, positions);
    let mut improved = true;
    while improved {
        improved = false;
        debug!(k = best_k, error = best_e, "Calibrating K");
        let new_k = best_k + delta;
        let new_e = mean_square_error(new_k, positions);
        if new_e < best_e {
            best_e = new_e;
            best_k = new_k;
            improved = true;
        } else {
            let new_k = best_k - delta;
            let new_e = mean_square_error(new_k, positions);
            if new_e < best_e {
                best_e = new_e;
                best_k = new_k;
                improved = true;
            }
        }
    }
    info!(k = best_k, error = best_e, "Smallest error found");
    best_k
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(label: f64, score: i32) -> TestPosition {
        TestPosition {
            position_text: String::new(),
            label,
            score,
        }
    }

    #[test]
    fn even_score_is_a_coin_flip() {
        assert_eq!(win_probability(0, K), 0.5);
    }

    #[test]
    fn probability_stays_inside_the_unit_interval() {
        for score in [-3000, -500, -1, 1, 500, 3000] {
            let p = win_probability(score, K);
            assert!(p > 0.0 && p < 1.0, "score {score} gave {p}");
        }
        assert!(win_probability(100, K) < win_probability(200, K));
    }

    #[test]
    fn probability_saturates_at_the_extremes() {
        assert!(win_probability(20_000, K) > 1.0 - 1e-12);
        assert!(win_probability(-20_000, K) < 1e-12);
    }

    #[test]
    fn correct_sides_give_small_error() {
        let positions = vec![position(1.0, 500), position(0.0, -500)];
        let error = mean_square_error(K, &positions);
        assert!((error - 0.000_423_046_870_617_286_44).abs() < 1e-12, "{error}");
    }

    #[test]
    fn perfect_predictions_have_zero_error() {
        let positions = vec![position(0.5, 0), position(0.5, 0), position(0.5, 0)];
        assert_eq!(mean_square_error(K, &positions), 0.0);
    }

    #[test]
    fn error_is_the_mean_of_squared_errors() {
        let positions = vec![position(1.0, 0), position(0.0, 0)];
        assert!((mean_square_error(K, &positions) - 0.25).abs() < 1e-15);
    }

    #[test]
    fn calibration_finds_a_k_that_does_not_worsen_the_fit() {
        let positions = vec![
            position(1.0, 200),
            position(0.5, 150),
            position(0.0, -300),
            position(1.0, 50),
        ];
        let start = 1.0;
        let best = find_smallest_k(start, 0.01, &positions);
        assert!(mean_square_error(best, &positions) <= mean_square_error(start, &positions));
        let e = mean_square_error(best, &positions);
        assert!(e <= mean_square_error(best + 0.01, &positions));
        assert!(e <= mean_square_error(best - 0.01, &positions));
    }
}
