//! Shape and stride arithmetic shared by tensors, kernels and the graph.

use crate::error::{RuntimeError, RuntimeResult};

/// Number of elements described by `shape`; the empty shape is a scalar.
pub fn numel(shape: &[usize]) -> RuntimeResult<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| {
        acc.checked_mul(dim).ok_or_else(|| {
            RuntimeError::InvalidShape(format!(
                "element count of {} overflows usize",
                shape_to_string(shape)
            ))
        })
    })
}

/// Default row-major strides: the rightmost dimension has stride 1.
pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut acc = 1usize;
    for i in (0..shape.len()).rev() {
        strides[i] = acc;
        acc = acc.saturating_mul(shape[i]);
    }
    strides
}

/// Linear element offset of `indices` under `strides`.
pub fn compute_offset(shape: &[usize], strides: &[usize], indices: &[usize]) -> RuntimeResult<usize> {
    if indices.len() != shape.len() {
        return Err(RuntimeError::RankMismatch {
            expected: shape.len(),
            got: indices.len(),
        });
    }
    let mut offset = 0;
    for (dim, (&idx, &size)) in indices.iter().zip(shape).enumerate() {
        if idx >= size {
            return Err(RuntimeError::OutOfRange(format!(
                "index {} out of range for dimension {} of size {}",
                idx, dim, size
            )));
        }
        offset += idx * strides[dim];
    }
    Ok(offset)
}

pub fn is_contiguous_strides(shape: &[usize], strides: &[usize]) -> bool {
    // Size-1 dimensions never move the cursor, so their stride is irrelevant.
    let mut expected = 1usize;
    for i in (0..shape.len()).rev() {
        if shape[i] != 1 && strides[i] != expected {
            return false;
        }
        expected = expected.saturating_mul(shape[i]);
    }
    true
}

/// NumPy-style broadcast of two shapes, aligned from the right.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> RuntimeResult<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(RuntimeError::shape_mismatch(
                    &shape_to_string(a),
                    &shape_to_string(b),
                    Some("dimensions must be equal or 1 to broadcast"),
                ))
            }
        };
    }
    Ok(out)
}

/// Strides that read a tensor of `shape`/`strides` as if it had `target` shape.
/// Broadcast dimensions get stride 0.
pub fn broadcast_strides(shape: &[usize], strides: &[usize], target: &[usize]) -> RuntimeResult<Vec<usize>> {
    if shape.len() > target.len() {
        return Err(RuntimeError::shape_mismatch(
            &shape_to_string(target),
            &shape_to_string(shape),
            Some("cannot broadcast to a lower rank"),
        ));
    }
    let lead = target.len() - shape.len();
    let mut out = vec![0; target.len()];
    for i in 0..shape.len() {
        let t = target[lead + i];
        if shape[i] == t {
            out[lead + i] = strides[i];
        } else if shape[i] == 1 {
            out[lead + i] = 0;
        } else {
            return Err(RuntimeError::shape_mismatch(
                &shape_to_string(target),
                &shape_to_string(shape),
                None,
            ));
        }
    }
    Ok(out)
}

pub fn shape_to_string(shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("[{}]", dims.join(", "))
}

/// Element offsets of a strided layout, visited in row-major logical order.
#[derive(Debug, Clone)]
pub struct StridedOffsets {
    shape: Vec<usize>,
    strides: Vec<usize>,
    index: Vec<usize>,
    current: usize,
    remaining: usize,
}

impl StridedOffsets {
    pub fn new(shape: &[usize], strides: &[usize], base: usize) -> Self {
        let remaining = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            strides: strides.to_vec(),
            index: vec![0; shape.len()],
            current: base,
            remaining,
        }
    }
}

impl Iterator for StridedOffsets {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let out = self.current;
        self.remaining -= 1;
        if self.remaining > 0 {
            // Odometer step from the innermost dimension.
            for dim in (0..self.shape.len()).rev() {
                self.index[dim] += 1;
                self.current += self.strides[dim];
                if self.index[dim] < self.shape[dim] {
                    break;
                }
                self.current -= self.strides[dim] * self.shape[dim];
                self.index[dim] = 0;
            }
        }
        Some(out)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedOffsets {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numel() {
        assert_eq!(numel(&[]).unwrap(), 1);
        assert_eq!(numel(&[2, 3, 4]).unwrap(), 24);
        assert_eq!(numel(&[5, 0, 3]).unwrap(), 0);
        assert!(matches!(numel(&[usize::MAX, 2]), Err(RuntimeError::InvalidShape(_))));
    }

    #[test]
    fn test_compute_strides() {
        assert_eq!(compute_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(compute_strides(&[7]), vec![1]);
        assert!(compute_strides(&[]).is_empty());
    }

    #[test]
    fn test_offset_corners() {
        for shape in [vec![1], vec![3, 4], vec![2, 3, 5], vec![4, 1, 2, 3]] {
            let strides = compute_strides(&shape);
            let zeros = vec![0; shape.len()];
            assert_eq!(compute_offset(&shape, &strides, &zeros).unwrap(), 0);
            let last: Vec<usize> = shape.iter().map(|d| d - 1).collect();
            assert_eq!(
                compute_offset(&shape, &strides, &last).unwrap(),
                numel(&shape).unwrap() - 1
            );
        }
    }

    #[test]
    fn test_offset_errors() {
        let shape = [3, 4];
        let strides = compute_strides(&shape);
        assert_eq!(
            compute_offset(&shape, &strides, &[1]),
            Err(RuntimeError::RankMismatch { expected: 2, got: 1 })
        );
        assert!(matches!(
            compute_offset(&shape, &strides, &[3, 0]),
            Err(RuntimeError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_contiguity() {
        assert!(is_contiguous_strides(&[2, 3], &[3, 1]));
        assert!(!is_contiguous_strides(&[2, 3], &[1, 2]));
        assert!(is_contiguous_strides(&[1, 3], &[99, 1]));
    }

    #[test]
    fn test_broadcast() {
        assert_eq!(broadcast_shapes(&[2, 1, 4], &[3, 1]).unwrap(), vec![2, 3, 4]);
        assert_eq!(broadcast_shapes(&[], &[5]).unwrap(), vec![5]);
        assert!(matches!(broadcast_shapes(&[2, 3], &[4]), Err(RuntimeError::ShapeMismatch(_))));
        assert_eq!(broadcast_strides(&[3, 1], &[1, 1], &[2, 3, 4]).unwrap(), vec![0, 1, 0]);
    }

    #[test]
    fn test_strided_offsets_transposed() {
        // [2, 3] row-major read through its transpose.
        let offsets: Vec<usize> = StridedOffsets::new(&[3, 2], &[1, 3], 0).collect();
        assert_eq!(offsets, vec![0, 3, 1, 4, 2, 5]);
        let scalar: Vec<usize> = StridedOffsets::new(&[], &[], 7).collect();
        assert_eq!(scalar, vec![7]);
        assert_eq!(StridedOffsets::new(&[2, 0], &[0, 1], 0).count(), 0);
    }
}
