//! Adaptive gate on discriminator updates.
//!
//! The discriminator steps only while its trailing accuracy stays below a
//! threshold, so an overpowering critic cannot stall the generator.

/// Trailing accuracy at or above which discriminator steps are skipped
pub const GATE_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccuracyGate {
    window: usize,
    threshold: f64,
}

/// Outcome of one gate evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateDecision {
    pub trailing_accuracy: f64,
    pub step: bool,
}

impl AccuracyGate {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            threshold: GATE_THRESHOLD,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Decide from the recorded accuracies, most recent last.
    ///
    /// An empty record always allows the step.
    pub fn evaluate(&self, accuracies: &[f64]) -> GateDecision {
        let take = self.window.min(accuracies.len());
        let trailing_accuracy = if take == 0 {
            0.0
        } else {
            accuracies[accuracies.len() - take..].iter().sum::<f64>() / take as f64
        };
        GateDecision {
            trailing_accuracy,
            step: trailing_accuracy < self.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_skipped_exactly_when_average_reaches_threshold() {
        let gate = AccuracyGate::new(3);
        let accuracies = [0.5, 0.75, 1.0, 1.0, 1.0, 0.5, 0.25, 0.5];
        // Trailing means: .5 .625 .75 .917 1 .833 .583 .417
        let expected = [true, true, true, false, false, false, true, true];

        for (i, &want) in expected.iter().enumerate() {
            let decision = gate.evaluate(&accuracies[..=i]);
            assert_eq!(decision.step, want, "batch {} avg {}", i, decision.trailing_accuracy);
            assert_eq!(decision.step, decision.trailing_accuracy < GATE_THRESHOLD);
        }
    }

    #[test]
    fn test_exact_threshold_blocks() {
        let gate = AccuracyGate::new(2);
        assert!(!gate.evaluate(&[0.8, 0.8]).step);
        assert!(gate.evaluate(&[]).step);
    }

    #[test]
    fn test_window_of_one_uses_latest() {
        let gate = AccuracyGate::new(0);
        assert_eq!(gate.window(), 1);
        assert!(gate.evaluate(&[1.0, 0.0]).step);
        assert!(!gate.evaluate(&[0.0, 1.0]).step);
    }
}
