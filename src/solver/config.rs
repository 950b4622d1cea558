//! Solver configuration: fixed at construction, reused across solves.

use serde::{Deserialize, Serialize};

use crate::mesh_error::MeshSolveError;

/// Preconditioner applied by the iterative backends.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preconditioner {
    None,
    /// Inverse diagonal; rows with a zero diagonal are left unscaled.
    #[default]
    Jacobi,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Relative residual `||b - Ax|| / ||b||` at which a solve counts as converged.
    pub tolerance: f64,
    pub max_iterations: usize,
    pub preconditioner: Preconditioner,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_iterations: 1000,
            preconditioner: Preconditioner::Jacobi,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<(), MeshSolveError> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(MeshSolveError::InvalidConfig(format!(
                "tolerance must be positive and finite, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(MeshSolveError::InvalidConfig(
                "max_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, MeshSolveError> {
        let cfg: Self =
            serde_json::from_str(json).map_err(|e| MeshSolveError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_preconditioner(mut self, preconditioner: Preconditioner) -> Self {
        self.preconditioner = preconditioner;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let cfg = SolverConfig::from_json_str(r#"{ "tolerance": 1e-6, "preconditioner": "none" }"#)
            .unwrap();
        assert_eq!(cfg.tolerance, 1e-6);
        assert_eq!(cfg.max_iterations, 1000);
        assert_eq!(cfg.preconditioner, Preconditioner::None);
    }

    #[test]
    fn non_positive_tolerance_is_rejected() {
        let err = SolverConfig::default().with_tolerance(0.0).validate().unwrap_err();
        assert!(matches!(err, MeshSolveError::InvalidConfig(_)));
        assert!(SolverConfig::from_json_str(r#"{ "max_iterations": 0 }"#).is_err());
    }

    #[test]
    fn malformed_json_is_a_configuration_error() {
        let err = SolverConfig::from_json_str("{ tolerance: ").unwrap_err();
        assert!(err.is_configuration());
    }
}
