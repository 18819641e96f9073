//! JitterSource port - retry jitter の乱数源
//!
//! 乱数を trait の裏に隔離して、backoff をテストで再現できるようにします。

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::domain::TaskId;

/// Uniform draws in `[0, 1)` for retry jitter.
pub trait JitterSource: Send + Sync {
    fn draw(&self, task_id: TaskId, attempt: u32) -> f64;
}

/// Seeds a fresh RNG per call from `(seed, task_id, attempt)`, so the same
/// task/attempt always gets the same jitter.
#[derive(Debug, Clone, Copy)]
pub struct SeededJitter {
    seed: u64,
}

impl SeededJitter {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Random process-wide seed.
    pub fn from_entropy() -> Self {
        Self::new(rand::random())
    }
}

impl JitterSource for SeededJitter {
    fn draw(&self, task_id: TaskId, attempt: u32) -> f64 {
        let id = task_id.as_ulid().0;
        let folded = (id as u64) ^ ((id >> 64) as u64);
        let seed = self.seed ^ folded ^ (u64::from(attempt)).rotate_left(32);
        StdRng::seed_from_u64(seed).r#gen::<f64>()
    }
}

/// Always the midpoint: backoff equals the nominal delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn draw(&self, _task_id: TaskId, _attempt: u32) -> f64 {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn seeded_draws_are_stable_and_in_range() {
        let jitter = SeededJitter::new(42);
        let task = TaskId::from_ulid(Ulid::new());

        for attempt in 1..20 {
            let a = jitter.draw(task, attempt);
            assert_eq!(a, jitter.draw(task, attempt));
            assert!((0.0..1.0).contains(&a));
        }
    }

    #[test]
    fn different_attempts_draw_differently() {
        let jitter = SeededJitter::new(42);
        let task = TaskId::from_ulid(Ulid::new());
        let draws: Vec<f64> = (1..6).map(|a| jitter.draw(task, a)).collect();
        assert!(draws.windows(2).any(|w| w[0] != w[1]));
    }
}
