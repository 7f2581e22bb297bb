//! Values carried by model variables.

use cyanea_core::{CyaneaError, Result};

use crate::network::AdmixtureNetwork;

/// Dense row-major square matrix, e.g. the taxa × taxa residual matrix.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SquareMatrix {
    dim: usize,
    data: Vec<f64>,
}

impl SquareMatrix {
    /// Build from row-major data; `data.len()` must equal `dim * dim`.
    pub fn new(dim: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != dim * dim {
            return Err(CyaneaError::InvalidInput(format!(
                "square matrix of dimension {dim} needs {} entries, got {}",
                dim * dim,
                data.len()
            )));
        }
        Ok(Self { dim, data })
    }

    pub fn zeros(dim: usize) -> Self {
        Self {
            dim,
            data: vec![0.0; dim * dim],
        }
    }

    pub fn from_fn(dim: usize, mut f: impl FnMut(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(dim * dim);
        for i in 0..dim {
            for j in 0..dim {
                data.push(f(i, j));
            }
        }
        Self { dim, data }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Entry at row `i`, column `j`.
    ///
    /// # Panics
    ///
    /// Panics if either index is out of range.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        assert!(i < self.dim && j < self.dim, "matrix index out of range");
        self.data[i * self.dim + j]
    }

    pub fn set(&mut self, i: usize, j: usize, value: f64) {
        assert!(i < self.dim && j < self.dim, "matrix index out of range");
        self.data[i * self.dim + j] = value;
    }

    /// Largest off-diagonal entry, or `-inf` for matrices smaller than 2×2.
    pub fn max_off_diagonal(&self) -> f64 {
        let mut max = f64::NEG_INFINITY;
        for i in 0..self.dim {
            for j in 0..self.dim {
                if i != j {
                    max = max.max(self.get(i, j));
                }
            }
        }
        max
    }
}

/// The value held by a variable in the model graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Real(f64),
    Integer(i64),
    Vector(Vec<f64>),
    Matrix(SquareMatrix),
    Network(Box<AdmixtureNetwork>),
}

impl Value {
    /// Short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Real(_) => "real",
            Value::Integer(_) => "integer",
            Value::Vector(_) => "vector",
            Value::Matrix(_) => "matrix",
            Value::Network(_) => "network",
        }
    }

    /// Whether `other` holds the same variant.
    pub fn same_type(&self, other: &Value) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    fn mismatch(&self, expected: &'static str) -> CyaneaError {
        CyaneaError::TypeMismatch {
            expected,
            found: self.type_name(),
        }
    }

    pub fn as_real(&self) -> Result<f64> {
        match self {
            Value::Real(x) => Ok(*x),
            other => Err(other.mismatch("real")),
        }
    }

    pub fn as_integer(&self) -> Result<i64> {
        match self {
            Value::Integer(k) => Ok(*k),
            other => Err(other.mismatch("integer")),
        }
    }

    pub fn as_vector(&self) -> Result<&[f64]> {
        match self {
            Value::Vector(v) => Ok(v),
            other => Err(other.mismatch("vector")),
        }
    }

    pub fn as_matrix(&self) -> Result<&SquareMatrix> {
        match self {
            Value::Matrix(m) => Ok(m),
            other => Err(other.mismatch("matrix")),
        }
    }

    pub fn as_network(&self) -> Result<&AdmixtureNetwork> {
        match self {
            Value::Network(n) => Ok(n),
            other => Err(other.mismatch("network")),
        }
    }

    pub fn as_network_mut(&mut self) -> Result<&mut AdmixtureNetwork> {
        match self {
            Value::Network(n) => Ok(n),
            other => Err(other.mismatch("network")),
        }
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Real(x)
    }
}

impl From<i64> for Value {
    fn from(k: i64) -> Self {
        Value::Integer(k)
    }
}

impl From<SquareMatrix> for Value {
    fn from(m: SquareMatrix) -> Self {
        Value::Matrix(m)
    }
}

impl From<AdmixtureNetwork> for Value {
    fn from(n: AdmixtureNetwork) -> Self {
        Value::Network(Box::new(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_rejects_wrong_length() {
        assert!(SquareMatrix::new(3, vec![0.0; 8]).is_err());
        let m = SquareMatrix::new(2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(m.get(1, 0), 3.0);
        assert_eq!(m.max_off_diagonal(), 3.0);
    }

    #[test]
    fn accessor_reports_variant() {
        let v = Value::Integer(3);
        assert_eq!(v.as_integer().unwrap(), 3);
        match v.as_real() {
            Err(CyaneaError::TypeMismatch { expected, found }) => {
                assert_eq!(expected, "real");
                assert_eq!(found, "integer");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(Value::Real(1.0).same_type(&Value::Real(2.0)));
        assert!(!Value::Real(1.0).same_type(&Value::Integer(1)));
    }
}
