use failure::{bail, format_err, Error};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Exp;
use serde::{Deserialize, Serialize};

/// A random variable as written in the config. Values are in microseconds wherever they are
/// used as durations
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum RandomVariable {
    Const(f64),
    /// Exponential with the given mean
    Exponential(f64),
    /// Uniform on [low, high)
    Uniform(f64, f64),
}

impl RandomVariable {
    pub fn validate(&self) -> Result<(), Error> {
        match *self {
            Self::Const(c) if !(c >= 0.) => bail!("Constant {} must be non-negative", c),
            Self::Exponential(mean) if !(mean > 0.) => {
                bail!("Exponential mean {} must be positive", mean)
            }
            Self::Uniform(low, high) if !(low >= 0. && low < high) => {
                bail!("Uniform bounds [{}, {}) are invalid", low, high)
            }
            _ => Ok(()),
        }
    }

    #[allow(dead_code)]
    pub fn mean(&self) -> f64 {
        match *self {
            Self::Const(c) => c,
            Self::Exponential(mean) => mean,
            Self::Uniform(low, high) => (low + high) / 2.,
        }
    }
}

/// Built form of a `RandomVariable`
#[derive(Clone, Copy, Debug)]
pub enum CustomDistribution {
    Const(f64),
    Exp(Exp<f64>),
    Uniform(Uniform<f64>),
}

impl Distribution<f64> for CustomDistribution {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            Self::Const(c) => *c,
            Self::Exp(dist) => dist.sample(rng),
            Self::Uniform(dist) => dist.sample(rng),
        }
    }
}

impl CustomDistribution {
    pub fn new(var: &RandomVariable) -> Result<Self, Error> {
        var.validate()?;
        Ok(match *var {
            RandomVariable::Const(c) => Self::Const(c),
            RandomVariable::Exponential(mean) => Self::Exp(
                Exp::new(1. / mean)
                    .map_err(|e| format_err!("Bad exponential mean {}: {:?}", mean, e))?,
            ),
            RandomVariable::Uniform(low, high) => Self::Uniform(Uniform::new(low, high)),
        })
    }
}

/// A distribution together with the generator that drives it
#[derive(Clone, Debug)]
pub struct Sampler<T: Distribution<f64>, U: Rng> {
    pub dist: T,
    pub rng: U,
}

impl<T: Distribution<f64>, U: Rng> Sampler<T, U> {
    pub fn sample(&mut self) -> f64 {
        self.dist.sample(&mut self.rng)
    }
}

pub type RandomStream = Sampler<CustomDistribution, StdRng>;

impl RandomStream {
    /// Independent, reproducible stream number `stream` derived from the run's seed
    pub fn from_config(var: &RandomVariable, seed: u64, stream: u64) -> Result<Self, Error> {
        Ok(Self {
            dist: CustomDistribution::new(var)?,
            rng: seeded_rng(seed, stream),
        })
    }
}

pub fn seeded_rng(seed: u64, stream: u64) -> StdRng {
    StdRng::seed_from_u64(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(RandomVariable::Exponential(0.).validate().is_err());
        assert!(RandomVariable::Exponential(-3.).validate().is_err());
        assert!(RandomVariable::Uniform(5., 5.).validate().is_err());
        assert!(RandomVariable::Const(-1.).validate().is_err());
        assert!(RandomVariable::Const(std::f64::NAN).validate().is_err());
        assert!(RandomVariable::Exponential(10.).validate().is_ok());
    }

    #[test]
    fn streams_are_reproducible() {
        let var = RandomVariable::Exponential(100.);
        let mut a = RandomStream::from_config(&var, 7, 3).unwrap();
        let mut b = RandomStream::from_config(&var, 7, 3).unwrap();
        let mut c = RandomStream::from_config(&var, 7, 4).unwrap();
        let xs: Vec<f64> = (0..10).map(|_| a.sample()).collect();
        let ys: Vec<f64> = (0..10).map(|_| b.sample()).collect();
        let zs: Vec<f64> = (0..10).map(|_| c.sample()).collect();
        assert_eq!(xs, ys);
        assert_ne!(xs, zs);
    }

    #[test]
    fn exponential_mean_is_close() {
        let mut s = RandomStream::from_config(&RandomVariable::Exponential(250.), 1, 0).unwrap();
        let n = 20_000;
        let mean = (0..n).map(|_| s.sample()).sum::<f64>() / n as f64;
        assert!((mean - 250.).abs() < 15., "sample mean {}", mean);
    }

    #[test]
    fn const_and_uniform() {
        let mut s = RandomStream::from_config(&RandomVariable::Const(4.), 1, 0).unwrap();
        assert_eq!(s.sample(), 4.);
        let mut u = RandomStream::from_config(&RandomVariable::Uniform(1., 2.), 1, 0).unwrap();
        for _ in 0..100 {
            let x = u.sample();
            assert!(x >= 1. && x < 2.);
        }
        assert_eq!(RandomVariable::Uniform(1., 3.).mean(), 2.);
    }
}
