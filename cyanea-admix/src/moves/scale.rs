//! Multiplicative scaling of a positive real variable.

use cyanea_core::Result;

use super::{tuning_factor, Failure, Outcome, Proposal, SCALAR_TARGET};
use crate::dag::{ModelGraph, Value, VariableId};
use crate::random::RandomSource;

/// Multiplies a real variable by `exp(λ (U − ½))`; `ln H = ln` of the
/// factor. Tuning widens `λ` when too many proposals are accepted.
#[derive(Debug, Clone)]
pub struct ScaleMove {
    variable: VariableId,
    lambda: f64,
}

impl ScaleMove {
    pub fn new(variable: VariableId) -> Self {
        Self {
            variable,
            lambda: 1.0,
        }
    }

    pub fn with_lambda(mut self, lambda: f64) -> Self {
        self.lambda = lambda;
        self
    }
}

impl Proposal for ScaleMove {
    fn name(&self) -> &str {
        "scale"
    }

    fn network(&self) -> Option<VariableId> {
        None
    }

    fn variables(&self) -> Vec<VariableId> {
        vec![self.variable]
    }

    fn propose(&mut self, graph: &mut ModelGraph, rng: &mut dyn RandomSource) -> Result<Outcome> {
        let current = graph.real(self.variable)?;
        let ln_factor = self.lambda * (rng.uniform01() - 0.5);
        let proposed = current * ln_factor.exp();
        if !proposed.is_finite() || proposed == 0.0 {
            return Ok(Outcome::Failed(Failure::DegenerateDraw));
        }
        graph.set_value(self.variable, Value::Real(proposed))?;
        Ok(Outcome::Proposed(ln_factor))
    }

    fn tune(&mut self, acceptance_rate: f64) {
        self.lambda *= tuning_factor(acceptance_rate, SCALAR_TARGET);
    }

    fn tuning(&self) -> Option<f64> {
        Some(self.lambda)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::{Move, MoveState};
    use super::*;
    use crate::random::SeededRandom;

    #[test]
    fn hastings_is_log_factor() {
        let mut model = Model::four_taxa(&[]);
        let rate = model.rates[0];
        let mut mv = Move::new(ScaleMove::new(rate).with_lambda(2.0), 1.0);
        let mut rng = SeededRandom::new(1);
        for _ in 0..20 {
            let ln = mv.perform(&mut model.graph, &mut rng).unwrap();
            assert_eq!(mv.state(), MoveState::Proposed);
            let value = model.graph.real(rate).unwrap();
            assert!((value.ln() - ln).abs() < 1e-12);
            assert!(ln.abs() <= 1.0);
            assert_eq!(mv.touched(), &[rate]);
            mv.reject(&mut model.graph);
            assert_eq!(model.graph.real(rate).unwrap(), 1.0);
        }
    }

    #[test]
    fn tuning_widens_on_high_acceptance() {
        let mut model = Model::four_taxa(&[]);
        let mut mv = Move::new(ScaleMove::new(model.rates[2]), 1.0);
        let mut rng = SeededRandom::new(4);
        for _ in 0..10 {
            mv.perform(&mut model.graph, &mut rng).unwrap();
            mv.accept(&mut model.graph);
        }
        mv.tune();
        assert!(mv.tuning().unwrap() > 1.0);
    }

    #[test]
    fn refuses_non_real_variables() {
        let mut model = Model::four_taxa(&[]);
        let before = model.snapshot();
        let mut mv = Move::new(ScaleMove::new(model.network), 1.0);
        let mut rng = SeededRandom::new(0);
        assert!(mv.perform(&mut model.graph, &mut rng).is_err());
        assert_eq!(mv.state(), MoveState::Idle);
        assert_eq!(model.snapshot(), before);
    }
}
