//! Parameter space declaration and the numeric encoding used by the surrogate.
//!
//! Every variable occupies a contiguous block of the encoded vector:
//! real and integer variables one slot scaled to `[0, 1]` over their bounds
//! (real log-uniform variables are scaled in log space), categorical
//! variables a one-hot block with one slot per choice.

use hd_types::{ConfigError, ParameterValue, Prior, RawParams, SpaceError, Variable, VariableKind};
use rand::Rng;
use std::collections::HashSet;

/// Ordered, validated collection of variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpace {
    variables: Vec<Variable>,
    offsets: Vec<usize>,
    dimension: usize,
}

impl ParameterSpace {
    pub fn new(variables: Vec<Variable>) -> Result<Self, ConfigError> {
        if variables.is_empty() {
            return Err(ConfigError::EmptySpace);
        }
        let mut names = HashSet::new();
        for variable in &variables {
            if !names.insert(variable.name.as_str()) {
                return Err(ConfigError::DuplicateVariable {
                    name: variable.name.clone(),
                });
            }
            variable.validate()?;
        }

        let mut offsets = Vec::with_capacity(variables.len());
        let mut dimension = 0;
        for variable in &variables {
            offsets.push(dimension);
            dimension += slot_width(&variable.kind);
        }

        Ok(Self {
            variables,
            offsets,
            dimension,
        })
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Length of the encoded vector.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Draw every variable independently and uniformly.
    pub fn sample_random<R: Rng + ?Sized>(&self, rng: &mut R) -> RawParams {
        self.variables
            .iter()
            .map(|variable| {
                let value = match &variable.kind {
                    VariableKind::Real { low, high, prior } => match prior {
                        Prior::Uniform => ParameterValue::Real(rng.random_range(*low..=*high)),
                        Prior::LogUniform => {
                            let log_value: f64 = rng.random_range(low.ln()..=high.ln());
                            ParameterValue::Real(log_value.exp().clamp(*low, *high))
                        }
                    },
                    VariableKind::Integer { low, high } => {
                        ParameterValue::Integer(rng.random_range(*low..=*high))
                    }
                    VariableKind::Categorical { choices } => {
                        let idx = rng.random_range(0..choices.len());
                        ParameterValue::Categorical(choices[idx].clone())
                    }
                };
                (variable.name.clone(), value)
            })
            .collect()
    }

    /// Uniform point of the encoded box `[0, 1]^d`. Not necessarily a valid
    /// encoding; pass it through [`project`](Self::project) before decoding.
    pub fn sample_unit<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        (0..self.dimension).map(|_| rng.random::<f64>()).collect()
    }

    pub fn encode(&self, raw: &RawParams) -> Result<Vec<f64>, SpaceError> {
        let mut encoded = vec![0.0; self.dimension];
        for (variable, &offset) in self.variables.iter().zip(&self.offsets) {
            let value = raw
                .get(&variable.name)
                .ok_or_else(|| SpaceError::MissingVariable {
                    name: variable.name.clone(),
                })?;

            match &variable.kind {
                VariableKind::Real { low, high, prior } => {
                    let v = value.as_f64().ok_or_else(|| type_mismatch(variable, "real", value))?;
                    check_bounds(variable, v, *low, *high)?;
                    encoded[offset] = match prior {
                        Prior::Uniform => to_unit(v, *low, *high),
                        Prior::LogUniform => to_unit(v.ln(), low.ln(), high.ln()),
                    };
                }
                VariableKind::Integer { low, high } => {
                    let v = match value {
                        ParameterValue::Integer(v) => *v,
                        ParameterValue::Real(v) if v.fract() == 0.0 => *v as i64,
                        other => return Err(type_mismatch(variable, "integer", other)),
                    };
                    check_bounds(variable, v as f64, *low as f64, *high as f64)?;
                    encoded[offset] = to_unit(v as f64, *low as f64, *high as f64);
                }
                VariableKind::Categorical { choices } => {
                    let label = value
                        .as_str()
                        .ok_or_else(|| type_mismatch(variable, "categorical", value))?;
                    let idx = choices.iter().position(|c| c == label).ok_or_else(|| {
                        SpaceError::InvalidChoice {
                            name: variable.name.clone(),
                            value: label.to_string(),
                        }
                    })?;
                    encoded[offset + idx] = 1.0;
                }
            }
        }
        Ok(encoded)
    }

    /// Inverse of [`encode`](Self::encode). Out-of-box slots are clamped,
    /// integers rounded, and categorical blocks resolved by arg-max (first
    /// index wins ties).
    pub fn decode(&self, x: &[f64]) -> Result<RawParams, SpaceError> {
        if x.len() != self.dimension {
            return Err(SpaceError::DimensionMismatch {
                expected: self.dimension,
                got: x.len(),
            });
        }

        let mut raw = RawParams::new();
        for (variable, &offset) in self.variables.iter().zip(&self.offsets) {
            let value = match &variable.kind {
                VariableKind::Real { low, high, prior } => {
                    let u = clamp_unit(x[offset]);
                    let v = match prior {
                        Prior::Uniform => from_unit(u, *low, *high),
                        Prior::LogUniform => from_unit(u, low.ln(), high.ln()).exp(),
                    };
                    ParameterValue::Real(v.clamp(*low, *high))
                }
                VariableKind::Integer { low, high } => {
                    ParameterValue::Integer(integer_from_unit(x[offset], *low, *high))
                }
                VariableKind::Categorical { choices } => {
                    let idx = argmax(&x[offset..offset + choices.len()]);
                    ParameterValue::Categorical(choices[idx].clone())
                }
            };
            raw.insert(variable.name.clone(), value);
        }
        Ok(raw)
    }

    /// Snap an arbitrary point onto the set of valid encodings: slots
    /// clamped to `[0, 1]`, integer slots moved to the nearest integer grid
    /// point, categorical blocks replaced by an exact one-hot indicator.
    /// Missing trailing slots read as zero.
    pub fn project(&self, x: &[f64]) -> Vec<f64> {
        let slot = |i: usize| x.get(i).copied().unwrap_or(0.0);
        let mut projected = vec![0.0; self.dimension];
        for (variable, &offset) in self.variables.iter().zip(&self.offsets) {
            match &variable.kind {
                VariableKind::Real { .. } => projected[offset] = clamp_unit(slot(offset)),
                VariableKind::Integer { low, high } => {
                    let v = integer_from_unit(slot(offset), *low, *high);
                    projected[offset] = to_unit(v as f64, *low as f64, *high as f64);
                }
                VariableKind::Categorical { choices } => {
                    let block: Vec<f64> = (offset..offset + choices.len()).map(slot).collect();
                    projected[offset + argmax(&block)] = 1.0;
                }
            }
        }
        projected
    }
}

fn slot_width(kind: &VariableKind) -> usize {
    match kind {
        VariableKind::Real { .. } | VariableKind::Integer { .. } => 1,
        VariableKind::Categorical { choices } => choices.len(),
    }
}

fn type_mismatch(variable: &Variable, expected: &'static str, got: &ParameterValue) -> SpaceError {
    SpaceError::TypeMismatch {
        name: variable.name.clone(),
        expected,
        got: got.to_string(),
    }
}

fn check_bounds(variable: &Variable, value: f64, low: f64, high: f64) -> Result<(), SpaceError> {
    if (low..=high).contains(&value) {
        Ok(())
    } else {
        Err(SpaceError::OutOfBounds {
            name: variable.name.clone(),
            value,
            low,
            high,
        })
    }
}

/// Scale `value` from `[lo, hi]` to `[0, 1]`; a degenerate range maps to the midpoint.
fn to_unit(value: f64, lo: f64, hi: f64) -> f64 {
    if (hi - lo).abs() < 1e-15 {
        0.5
    } else {
        (value - lo) / (hi - lo)
    }
}

fn from_unit(u: f64, lo: f64, hi: f64) -> f64 {
    lo + u * (hi - lo)
}

fn clamp_unit(u: f64) -> f64 {
    if u.is_nan() {
        0.5
    } else {
        u.clamp(0.0, 1.0)
    }
}

fn integer_from_unit(u: f64, low: i64, high: i64) -> i64 {
    let v = from_unit(clamp_unit(u), low as f64, high as f64).round() as i64;
    v.clamp(low, high)
}

/// Index of the largest slot; NaN never wins, ties go to the first index.
fn argmax(block: &[f64]) -> usize {
    let mut best_idx = 0;
    let mut best = f64::NEG_INFINITY;
    for (idx, &v) in block.iter().enumerate() {
        if v > best {
            best = v;
            best_idx = idx;
        }
    }
    best_idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn mixed_space() -> ParameterSpace {
        ParameterSpace::new(vec![
            Variable::real("x", -10.0, 10.0),
            Variable::log_uniform("lr", 1e-4, 1e-1),
            Variable::integer("layers", 1, 4),
            Variable::categorical("opt", ["adam", "sgd", "rmsprop"]),
        ])
        .unwrap()
    }

    #[test]
    fn dimension_counts_one_hot_blocks() {
        assert_eq!(mixed_space().dimension(), 6);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = ParameterSpace::new(vec![
            Variable::real("x", 0.0, 1.0),
            Variable::real("x", 0.0, 2.0),
        ])
        .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateVariable { name: "x".into() });
    }

    #[test]
    fn bounds_too_wide_to_sample_are_rejected() {
        let err = ParameterSpace::new(vec![Variable::real("x", -1e308, 1e308)]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBounds { .. }));

        // A wide span that still fits in an f64 samples normally.
        let space = ParameterSpace::new(vec![Variable::real("x", -8e307, 8e307)]).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let x = space.sample_random(&mut rng)["x"].as_f64().unwrap();
        assert!(x.is_finite());
    }

    #[test]
    fn sampled_points_round_trip() {
        let space = mixed_space();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..200 {
            let raw = space.sample_random(&mut rng);
            let decoded = space.decode(&space.encode(&raw).unwrap()).unwrap();

            assert_eq!(decoded["layers"], raw["layers"]);
            assert_eq!(decoded["opt"], raw["opt"]);
            for name in ["x", "lr"] {
                let (a, b) = (raw[name].as_f64().unwrap(), decoded[name].as_f64().unwrap());
                assert!((a - b).abs() <= 1e-9 * a.abs().max(1.0), "{name}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn samples_respect_bounds() {
        let space = mixed_space();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let raw = space.sample_random(&mut rng);
            let x = raw["x"].as_f64().unwrap();
            let lr = raw["lr"].as_f64().unwrap();
            assert!((-10.0..=10.0).contains(&x));
            assert!((1e-4..=1e-1).contains(&lr));
            match raw["layers"] {
                ParameterValue::Integer(v) => assert!((1..=4).contains(&v)),
                ref other => panic!("unexpected layers value: {other:?}"),
            }
        }
    }

    #[test]
    fn binary_categorical_space() {
        let space = ParameterSpace::new(vec![Variable::categorical("opt", ["a", "b"])]).unwrap();
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..50 {
            let raw = space.sample_random(&mut rng);
            let label = raw["opt"].as_str().unwrap().to_string();
            assert!(label == "a" || label == "b");

            let encoded = space.encode(&raw).unwrap();
            assert_eq!(encoded.iter().sum::<f64>(), 1.0);
            assert!(encoded.iter().all(|&v| v == 0.0 || v == 1.0));
        }

        for pair in [[0.2, 0.7], [0.9, -3.0], [0.5, 0.5], [f64::NAN, 0.1], [-1.0, -2.0]] {
            let raw = space.decode(&pair).unwrap();
            let label = raw["opt"].as_str().unwrap();
            assert!(label == "a" || label == "b");
        }
        assert_eq!(space.decode(&[0.5, 0.5]).unwrap()["opt"].as_str(), Some("a"));
    }

    #[test]
    fn decode_clamps_and_rounds() {
        let space = mixed_space();
        let raw = space.decode(&[1.7, -0.3, 0.49, 0.0, 0.0, 0.2]).unwrap();
        assert_eq!(raw["x"], ParameterValue::Real(10.0));
        assert!((raw["lr"].as_f64().unwrap() - 1e-4).abs() < 1e-12);
        // 1 + 0.49 * 3 = 2.47
        assert_eq!(raw["layers"], ParameterValue::Integer(2));
        assert_eq!(raw["opt"].as_str(), Some("rmsprop"));
    }

    #[test]
    fn encode_rejects_mismatches() {
        let space = mixed_space();
        let mut rng = StdRng::seed_from_u64(1);
        let mut raw = space.sample_random(&mut rng);

        raw.insert("opt".into(), ParameterValue::Categorical("adagrad".into()));
        assert!(matches!(space.encode(&raw), Err(SpaceError::InvalidChoice { .. })));

        raw.remove("opt");
        assert_eq!(
            space.encode(&raw),
            Err(SpaceError::MissingVariable { name: "opt".into() })
        );

        let mut raw = space.sample_random(&mut rng);
        raw.insert("x".into(), ParameterValue::Real(11.0));
        assert!(matches!(space.encode(&raw), Err(SpaceError::OutOfBounds { .. })));
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let space = mixed_space();
        assert_eq!(
            space.decode(&[0.5; 3]),
            Err(SpaceError::DimensionMismatch {
                expected: 6,
                got: 3
            })
        );
    }

    #[test]
    fn project_produces_valid_encodings() {
        let space = mixed_space();
        let projected = space.project(&[0.25, 2.0, 0.4, 0.3, 0.8, 0.1]);
        assert_eq!(projected[0], 0.25);
        assert_eq!(projected[1], 1.0);
        // layers 1 + 0.4 * 3 = 2.2 -> 2 -> (2 - 1) / 3
        assert!((projected[2] - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(&projected[3..], &[0.0, 1.0, 0.0]);

        let raw = space.decode(&projected).unwrap();
        assert_eq!(space.encode(&raw).unwrap()[3..], projected[3..]);
    }

    #[test]
    fn degenerate_ranges_encode_to_midpoint() {
        let space = ParameterSpace::new(vec![
            Variable::real("x", 2.0, 2.0),
            Variable::integer("n", 5, 5),
        ])
        .unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let raw = space.sample_random(&mut rng);
        assert_eq!(space.encode(&raw).unwrap(), vec![0.5, 0.5]);
        assert_eq!(space.decode(&[0.9, 0.1]).unwrap(), raw);
    }
}
