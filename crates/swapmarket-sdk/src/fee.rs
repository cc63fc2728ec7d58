use crate::error::{Error, Result};

/// Discounted virtual bytes covered by one unit of fee (0.1 sat/vB).
pub const FEE_DIVISOR: u64 = 10;

/// Anything whose declared fee can be checked against its own size.
pub trait FeeSized {
    fn declared_fee(&self) -> u64;
    fn discount_vsize(&self) -> usize;
}

/// Fee a transaction of `vsize` discounted virtual bytes must declare.
pub fn required_fee(vsize: usize) -> u64 {
    (vsize as u64).div_ceil(FEE_DIVISOR)
}

/// Rebuilds a transaction until its declared fee matches its size.
#[derive(Debug, Clone, Copy)]
pub struct FeeConverger {
    max_iterations: u32,
}

impl Default for FeeConverger {
    fn default() -> Self {
        Self { max_iterations: 3 }
    }
}

impl FeeConverger {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
        }
    }

    /// Call `build` with a proposed fee, starting from `initial_fee`, and feed
    /// the size-derived fee back in until the two agree. The declared fee may
    /// exceed the proposal when dust is added to it. After the last iteration
    /// an overpaying candidate is accepted; an underpaying one is not.
    pub fn converge<T, F>(&self, initial_fee: u64, mut build: F) -> Result<T>
    where
        T: FeeSized,
        F: FnMut(u64) -> Result<T>,
    {
        let mut fee = initial_fee;
        let mut last = None;
        for attempt in 1..=self.max_iterations {
            let candidate = build(fee)?;
            let required = required_fee(candidate.discount_vsize());
            log::debug!(
                "fee: attempt {attempt} declared {} required {required}",
                candidate.declared_fee()
            );
            if fee == required && candidate.declared_fee() >= required {
                return Ok(candidate);
            }
            fee = required;
            last = Some((candidate, required));
        }

        match last {
            Some((candidate, required)) if candidate.declared_fee() >= required => {
                log::info!(
                    "fee: accepting {} after {} iterations (required {required})",
                    candidate.declared_fee(),
                    self.max_iterations
                );
                Ok(candidate)
            }
            Some((candidate, required)) => Err(Error::FeeNotConverged {
                paid: candidate.declared_fee(),
                required,
            }),
            None => Err(Error::FeeNotConverged {
                paid: initial_fee,
                required: 0,
            }),
        }
    }
}
