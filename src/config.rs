//! Configuration of a domain.

use crate::{
    error::DomainError,
    focus::Acceptance,
    geometry::{Boundary, BoundingBox},
};

/// Parameters of the domain decomposition.
///
/// The rank count and rank id are taken from the communicator.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DomainConfig {
    /// Maximum number of particles per leaf of the global tree.
    pub bucket_size: u64,
    /// Relative deviation of a rank count from the mean above which a warning is logged.
    pub balance_tolerance: f64,
    /// The simulation box. Open axes are refitted to the particles each step unless
    /// `fixed_box` is set; periodic axes are never changed.
    pub bounding_box: BoundingBox,
    /// Keep the box as given.
    pub fixed_box: bool,
    /// Acceptance policy for aggregating distant nodes of the focus tree.
    pub acceptance: Acceptance,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            bucket_size: 64,
            balance_tolerance: 0.2,
            bounding_box: BoundingBox::unit(Boundary::Open),
            fixed_box: false,
            acceptance: Acceptance::default(),
        }
    }
}

impl DomainConfig {
    /// Set the bucket size.
    pub fn with_bucket_size(mut self, bucket_size: u64) -> Self {
        self.bucket_size = bucket_size;
        self
    }

    /// Set the balance tolerance.
    pub fn with_balance_tolerance(mut self, balance_tolerance: f64) -> Self {
        self.balance_tolerance = balance_tolerance;
        self
    }

    /// Set the initial box.
    pub fn with_bounding_box(mut self, bounding_box: BoundingBox) -> Self {
        self.bounding_box = bounding_box;
        self
    }

    /// Keep the box fixed.
    pub fn with_fixed_box(mut self, fixed_box: bool) -> Self {
        self.fixed_box = fixed_box;
        self
    }

    /// Set the acceptance policy of the focus tree.
    pub fn with_acceptance(mut self, acceptance: Acceptance) -> Self {
        self.acceptance = acceptance;
        self
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.bucket_size == 0 {
            return Err(DomainError::InvalidBucketSize);
        }
        if !(self.balance_tolerance.is_finite() && self.balance_tolerance >= 0.0) {
            return Err(DomainError::InvalidConfig(format!(
                "balance tolerance {} must be a non-negative number",
                self.balance_tolerance
            )));
        }
        if let Acceptance::OpeningAngle(theta) = self.acceptance {
            if !(theta.is_finite() && theta > 0.0) {
                return Err(DomainError::InvalidConfig(format!(
                    "opening angle {theta} must be positive"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::DomainConfig;
    use crate::{error::DomainError, focus::Acceptance};

    #[test]
    fn test_validate() {
        assert!(DomainConfig::default().validate().is_ok());
        assert_eq!(
            DomainConfig::default().with_bucket_size(0).validate(),
            Err(DomainError::InvalidBucketSize)
        );
        assert!(DomainConfig::default()
            .with_balance_tolerance(f64::NAN)
            .validate()
            .is_err());
        assert!(DomainConfig::default()
            .with_acceptance(Acceptance::OpeningAngle(-1.0))
            .validate()
            .is_err());
    }
}
