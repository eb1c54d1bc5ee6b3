//! Statistics over price history and trade outcomes: return correlation,
//! drawdown, and per-batch win/loss figures.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

/// Win/loss summary of a batch of closed-trade returns.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeStats {
    pub count: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64,
    pub avg_win: Option<f64>,
    pub avg_loss: Option<f64>,
}

impl OutcomeStats {
    /// Average win over average loss, when the batch has both.
    pub fn win_loss_ratio(&self) -> Option<f64> {
        match (self.avg_win, self.avg_loss) {
            (Some(win), Some(loss)) if loss > 0.0 => Some(win / loss),
            _ => None,
        }
    }
}

/// Drawdown figures for an equity series.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawdownStats {
    pub peak: Decimal,
    pub last: Decimal,
    pub current: Decimal,
    pub max: Decimal,
}

/// Stateless statistics helpers.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Simple daily returns from a close series sorted by date.
    pub fn daily_returns(closes: &[(NaiveDate, f64)]) -> Vec<(NaiveDate, f64)> {
        closes
            .windows(2)
            .filter(|w| w[0].1 > 0.0)
            .map(|w| (w[1].0, w[1].1 / w[0].1 - 1.0))
            .collect()
    }

    /// Pearson correlation of daily returns over dates both series share.
    ///
    /// Returns `None` when fewer than `min_overlap` returns line up or either
    /// side is flat.
    pub fn correlation(
        a: &[(NaiveDate, f64)],
        b: &[(NaiveDate, f64)],
        min_overlap: usize,
    ) -> Option<f64> {
        let ra = Self::daily_returns(a);
        let rb = Self::daily_returns(b);

        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for (date, x) in &ra {
            if let Some((_, y)) = rb.iter().find(|(d, _)| d == date) {
                xs.push(*x);
                ys.push(*y);
            }
        }

        if xs.len() < min_overlap.max(2) {
            return None;
        }

        let sd_x = xs.iter().std_dev();
        let sd_y = ys.iter().std_dev();
        if !(sd_x > 0.0 && sd_y > 0.0) {
            return None;
        }

        let corr = xs.iter().covariance(ys.iter()) / (sd_x * sd_y);
        corr.is_finite().then(|| corr.clamp(-1.0, 1.0))
    }

    /// Win rate and average win/loss of a batch of returns.
    pub fn outcome_stats(returns: &[f64]) -> OutcomeStats {
        let (wins, losses): (Vec<f64>, Vec<f64>) = returns.iter().partition(|&&r| r > 0.0);
        let count = returns.len() as u32;

        OutcomeStats {
            count,
            wins: wins.len() as u32,
            losses: losses.len() as u32,
            win_rate: if count > 0 {
                wins.len() as f64 / count as f64
            } else {
                0.0
            },
            avg_win: (!wins.is_empty()).then(|| wins.iter().mean()),
            avg_loss: (!losses.is_empty()).then(|| losses.iter().map(|l| l.abs()).mean()),
        }
    }

    /// Peak, current and maximum drawdown of an equity series.
    pub fn drawdown(equity: &[Decimal]) -> Option<DrawdownStats> {
        let first = *equity.first()?;
        let mut peak = first;
        let mut max = Decimal::ZERO;

        for value in equity {
            if *value > peak {
                peak = *value;
            }
            if peak > Decimal::ZERO {
                let dd = (peak - *value) / peak;
                if dd > max {
                    max = dd;
                }
            }
        }

        let last = *equity.last()?;
        let current = if peak > Decimal::ZERO && last < peak {
            (peak - last) / peak
        } else {
            Decimal::ZERO
        };

        Some(DrawdownStats {
            peak,
            last,
            current,
            max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn series(start: NaiveDate, closes: &[f64]) -> Vec<(NaiveDate, f64)> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| (start + chrono::Duration::days(i as i64), *c))
            .collect()
    }

    #[test]
    fn test_correlation_of_scaled_series() {
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let a = series(start, &[100.0, 102.0, 101.0, 105.0, 104.0, 108.0]);
        let b = series(start, &[50.0, 51.0, 50.5, 52.5, 52.0, 54.0]);

        let corr = MetricsCalculator::correlation(&a, &b, 3).unwrap();
        assert!(corr > 0.99);
    }

    #[test]
    fn test_correlation_needs_overlap() {
        let a = series(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(), &[1.0, 2.0, 3.0, 2.0]);
        let b = series(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(), &[1.0, 2.0, 3.0, 2.0]);

        assert_eq!(MetricsCalculator::correlation(&a, &b, 2), None);
    }

    #[test]
    fn test_outcome_stats() {
        let stats = MetricsCalculator::outcome_stats(&[0.10, -0.05, 0.06, -0.03, 0.02]);

        assert_eq!(stats.wins, 3);
        assert_eq!(stats.losses, 2);
        assert!((stats.win_rate - 0.6).abs() < 1e-9);
        assert!((stats.win_loss_ratio().unwrap() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_drawdown() {
        let dd = MetricsCalculator::drawdown(&[
            dec!(100),
            dec!(150),
            dec!(70),
            dec!(50),
            dec!(150),
            dec!(120),
        ])
        .unwrap();

        assert_eq!(dd.peak, dec!(150));
        assert_eq!(dd.current, dec!(0.2));
        assert!(dd.max > dec!(0.66) && dd.max < dec!(0.67));
    }
}
