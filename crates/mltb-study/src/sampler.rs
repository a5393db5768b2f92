//! Independent random sampling across parameter distributions.

use rand::rngs::StdRng;
use rand::SeedableRng;

use mltb_types::ParamValue;

use crate::distributions::Distribution;

/// Samples every parameter independently from its distribution.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    rng: StdRng,
}

impl RandomSampler {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { rng }
    }

    pub fn sample(&mut self, distribution: &Distribution) -> ParamValue {
        distribution.sample(&mut self.rng)
    }
}

impl Default for RandomSampler {
    fn default() -> Self {
        Self::new(None)
    }
}
