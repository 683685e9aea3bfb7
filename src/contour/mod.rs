//! Note-indexed control signals derived from score analysis.
//!
//! A [`Contour`] holds one value per note-on in the tune and a private
//! cursor; the groover advances every contour exactly once per note-on.
//! Generators live in the submodules, composition operators here.

use thiserror::Error;

pub mod harmony;
pub mod intensity;
pub mod recipe;
pub mod shapes;

#[derive(Debug, Error, PartialEq)]
pub enum ContourError {
    #[error("contour has not been computed yet")]
    Uncomputed,
    #[error("contour index {index} out of range for length {len}")]
    InvalidIndex { index: isize, len: usize },
    #[error("invalid contour recipe: {0}")]
    InvalidRecipe(String),
}

/// A finite sequence of per-note values with a sequential cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct Contour {
    values: Option<Vec<f64>>,
    index: isize,
}

impl Contour {
    /// A contour that has not been computed; `next()` fails until values
    /// are supplied.
    pub fn uncomputed() -> Self {
        Self {
            values: None,
            index: -1,
        }
    }

    pub fn from_values(values: Vec<f64>) -> Self {
        Self {
            values: Some(values),
            index: -1,
        }
    }

    pub fn len(&self) -> usize {
        self.values.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> Result<&[f64], ContourError> {
        self.values.as_deref().ok_or(ContourError::Uncomputed)
    }

    /// Advance the cursor and return the value under it.
    pub fn next(&mut self) -> Result<f64, ContourError> {
        let values = self.values.as_ref().ok_or(ContourError::Uncomputed)?;
        self.index += 1;
        if self.index < 0 || self.index as usize >= values.len() {
            return Err(ContourError::InvalidIndex {
                index: self.index,
                len: values.len(),
            });
        }
        Ok(values[self.index as usize])
    }

    /// The next call to `next()` returns the first value again.
    pub fn reset(&mut self) {
        self.index = -1;
    }

    /// Position the cursor so the next call to `next()` returns value `i`.
    pub fn jump(&mut self, i: usize) -> Result<(), ContourError> {
        let len = self.len();
        if self.values.is_none() {
            return Err(ContourError::Uncomputed);
        }
        if i >= len {
            return Err(ContourError::InvalidIndex {
                index: i as isize,
                len,
            });
        }
        self.index = i as isize - 1;
        Ok(())
    }
}

/// Weighted sum of contours of equal length. Weights are renormalized by
/// their absolute sum; a negative weight inverts its contour (`1 - x`)
/// before weighting.
pub fn weighted_sum(contours: &[&Contour], weights: &[f64]) -> Result<Contour, ContourError> {
    if contours.is_empty() || contours.len() != weights.len() {
        return Err(ContourError::InvalidRecipe(format!(
            "weighted_sum needs one weight per contour, got {} contours and {} weights",
            contours.len(),
            weights.len()
        )));
    }

    let len = contours[0].len();
    let total: f64 = weights.iter().map(|w| w.abs()).sum();
    if total == 0.0 {
        return Err(ContourError::InvalidRecipe(
            "weighted_sum weights must not all be zero".to_string(),
        ));
    }

    let mut result = vec![0.0; len];
    for (contour, &weight) in contours.iter().zip(weights) {
        let values = contour.values()?;
        if values.len() != len {
            return Err(ContourError::InvalidRecipe(format!(
                "weighted_sum length mismatch: {} vs {}",
                values.len(),
                len
            )));
        }
        let w = weight.abs() / total;
        for (slot, &v) in result.iter_mut().zip(values) {
            *slot += w * if weight < 0.0 { 1.0 - v } else { v };
        }
    }

    Ok(Contour::from_values(result))
}

/// Elementwise product of contours of equal length.
pub fn multiply(contours: &[&Contour]) -> Result<Contour, ContourError> {
    let Some(first) = contours.first() else {
        return Err(ContourError::InvalidRecipe(
            "multiply needs at least one contour".to_string(),
        ));
    };

    let mut result = first.values()?.to_vec();
    for contour in &contours[1..] {
        let values = contour.values()?;
        if values.len() != result.len() {
            return Err(ContourError::InvalidRecipe(format!(
                "multiply length mismatch: {} vs {}",
                values.len(),
                result.len()
            )));
        }
        for (slot, &v) in result.iter_mut().zip(values) {
            *slot *= v;
        }
    }

    Ok(Contour::from_values(result))
}

/// Affine transform `scale * x + offset` of every value.
pub fn linear_transform(contour: &Contour, scale: f64, offset: f64) -> Result<Contour, ContourError> {
    let values = contour.values()?;
    Ok(Contour::from_values(
        values.iter().map(|v| scale * v + offset).collect(),
    ))
}

/// Circular rotation by `amount` note indices (positive moves values later).
pub fn shift(contour: &Contour, amount: i64) -> Result<Contour, ContourError> {
    let values = contour.values()?;
    let len = values.len();
    if len == 0 {
        return Ok(Contour::from_values(Vec::new()));
    }
    let rotation = amount.rem_euclid(len as i64) as usize;
    let mut result = Vec::with_capacity(len);
    for i in 0..len {
        result.push(values[(i + len - rotation) % len]);
    }
    Ok(Contour::from_values(result))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn next_before_compute_fails() {
        let mut contour = Contour::uncomputed();
        assert_eq!(contour.next(), Err(ContourError::Uncomputed));
    }

    #[test]
    fn next_past_end_fails_with_invalid_index() {
        let mut contour = Contour::from_values(vec![0.1, 0.2, 0.3]);
        for _ in 0..3 {
            contour.next().unwrap();
        }
        assert!(matches!(
            contour.next(),
            Err(ContourError::InvalidIndex { index: 3, len: 3 })
        ));
    }

    #[test]
    fn reset_replays_the_same_sequence() {
        let mut contour = Contour::from_values(vec![0.4, 0.8, 0.6]);
        let first: Vec<f64> = (0..3).map(|_| contour.next().unwrap()).collect();
        contour.reset();
        let second: Vec<f64> = (0..3).map(|_| contour.next().unwrap()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn jump_matches_sequential_traversal() {
        let values = vec![0.1, 0.9, 0.5, 0.3];
        let mut sequential = Contour::from_values(values.clone());
        let mut target = 0.0;
        for _ in 0..3 {
            target = sequential.next().unwrap();
        }

        let mut jumped = Contour::from_values(values);
        jumped.jump(2).unwrap();
        assert_eq!(jumped.next().unwrap(), target);
    }

    #[test]
    fn jump_past_end_fails() {
        let mut contour = Contour::from_values(vec![0.1, 0.2]);
        assert!(contour.jump(2).is_err());
        assert!(contour.jump(1).is_ok());
    }

    #[test]
    fn weighted_sum_stays_in_convex_hull() {
        let a = Contour::from_values(vec![0.0, 0.2, 0.4, 1.0]);
        let b = Contour::from_values(vec![1.0, 0.6, 0.4, 0.0]);
        let sum = weighted_sum(&[&a, &b], &[0.3, 0.7]).unwrap();
        let (av, bv, sv) = (a.values().unwrap(), b.values().unwrap(), sum.values().unwrap());
        for i in 0..sv.len() {
            let lo = av[i].min(bv[i]);
            let hi = av[i].max(bv[i]);
            assert!(sv[i] >= lo - 1e-12 && sv[i] <= hi + 1e-12);
        }
    }

    #[test]
    fn negative_weight_inverts() {
        let a = Contour::from_values(vec![0.0, 1.0]);
        let sum = weighted_sum(&[&a], &[-1.0]).unwrap();
        assert_eq!(sum.values().unwrap(), &[1.0, 0.0]);
    }

    #[test]
    fn mismatched_lengths_are_a_recipe_error() {
        let a = Contour::from_values(vec![0.0, 1.0]);
        let b = Contour::from_values(vec![0.5]);
        assert!(matches!(
            weighted_sum(&[&a, &b], &[0.5, 0.5]),
            Err(ContourError::InvalidRecipe(_))
        ));
    }

    #[test]
    fn shift_rotates_circularly() {
        let a = Contour::from_values(vec![1.0, 2.0, 3.0, 4.0]);
        let shifted = shift(&a, 1).unwrap();
        assert_eq!(shifted.values().unwrap(), &[4.0, 1.0, 2.0, 3.0]);
        let back = shift(&shifted, -1).unwrap();
        assert_eq!(back.values().unwrap(), a.values().unwrap());
    }

    #[test]
    fn linear_transform_is_affine() {
        let a = Contour::from_values(vec![0.0, 0.5, 1.0]);
        let t = linear_transform(&a, 2.0, 1.0).unwrap();
        assert_eq!(t.values().unwrap(), &[1.0, 2.0, 3.0]);
    }
}
