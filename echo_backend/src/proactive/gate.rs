/// Random decisions used by probabilistic evaluators. Injected so tests can script outcomes.
pub trait RandomGate: Send + Sync {
    /// True with the given probability.
    fn chance(&self, probability: f64) -> bool;

    /// Uniform index in `0..len`. `len` of zero yields zero.
    fn pick_index(&self, len: usize) -> usize;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngGate;

impl RandomGate for ThreadRngGate {
    fn chance(&self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        rand::random::<f64>() < probability
    }

    fn pick_index(&self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        rand::random_range(0..len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extreme_probabilities_are_deterministic() {
        let gate = ThreadRngGate;
        for _ in 0..100 {
            assert!(!gate.chance(0.0));
            assert!(gate.chance(1.0));
        }
    }

    #[test]
    fn pick_index_stays_in_bounds() {
        let gate = ThreadRngGate;
        assert_eq!(gate.pick_index(0), 0);
        assert_eq!(gate.pick_index(1), 0);
        for _ in 0..100 {
            assert!(gate.pick_index(3) < 3);
        }
    }
}
