//! Dense row-major embedding matrix and the similarity math that runs over it.

/// Flat `rows × dimension` buffer. Row `i` belongs to the `i`-th id of the owning store.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMatrix {
    dimension: usize,
    data: Vec<f32>,
}

impl EmbeddingMatrix {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn rows(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn row(&self, index: usize) -> Option<&[f32]> {
        let start = index.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        // chunks_exact panics on 0; an empty slice yields nothing either way.
        let data = if self.dimension == 0 { &[][..] } else { &self.data[..] };
        data.chunks_exact(self.dimension.max(1))
    }

    pub fn push_row(&mut self, row: &[f32]) {
        debug_assert_eq!(row.len(), self.dimension);
        self.data.extend_from_slice(row);
    }

    /// Overwrite row `index` in place. Returns false when out of range.
    pub fn set_row(&mut self, index: usize, row: &[f32]) -> bool {
        debug_assert_eq!(row.len(), self.dimension);
        let start = index * self.dimension;
        match self.data.get_mut(start..start + self.dimension) {
            Some(slot) => {
                slot.copy_from_slice(row);
                true
            }
            None => false,
        }
    }

    /// Remove row `index`, shifting later rows up by one.
    pub fn remove_row(&mut self, index: usize) -> bool {
        let start = index * self.dimension;
        if start + self.dimension > self.data.len() {
            return false;
        }
        self.data.drain(start..start + self.dimension);
        true
    }

    /// Cosine similarity between `query` and every row, in row order.
    pub fn cosine_similarities(&self, query: &[f32]) -> Vec<f32> {
        let q_norm = normalize(query);
        self.iter_rows()
            .map(|row| dot(&q_norm, &normalize(row)).clamp(-1.0, 1.0))
            .collect()
    }
}

pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Unit-length copy of `v`. A zero (or non-finite norm) vector comes back as all zeros,
/// so its similarity to anything is 0.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = norm(v);
    if norm <= 0.0 || !norm.is_finite() {
        return vec![0.0; v.len()];
    }
    v.iter().map(|x| x / norm).collect()
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    dot(&normalize(a), &normalize(b)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn rows_are_pushed_updated_and_removed() {
        let mut m = EmbeddingMatrix::new(2);
        m.push_row(&[1.0, 2.0]);
        m.push_row(&[3.0, 4.0]);
        m.push_row(&[5.0, 6.0]);
        assert_eq!(m.rows(), 3);

        assert!(m.set_row(1, &[7.0, 8.0]));
        assert_eq!(m.row(1), Some(&[7.0, 8.0][..]));
        assert!(!m.set_row(3, &[0.0, 0.0]));

        assert!(m.remove_row(0));
        assert_eq!(m.rows(), 2);
        assert_eq!(m.row(0), Some(&[7.0, 8.0][..]));
        assert_eq!(m.row(1), Some(&[5.0, 6.0][..]));
        assert_eq!(m.row(2), None);
        assert!(!m.remove_row(2));
    }

    #[test]
    fn cosine_of_known_vectors() {
        assert!(approx(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0));
        assert!(approx(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0));
        assert!(approx(cosine_similarity(&[1.0, 0.0], &[-2.0, 0.0]), -1.0));
        assert!(approx(cosine_similarity(&[3.0, 4.0], &[6.0, 8.0]), 1.0));
    }

    #[test]
    fn zero_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        let mut m = EmbeddingMatrix::new(2);
        m.push_row(&[0.0, 0.0]);
        m.push_row(&[1.0, 1.0]);
        let scores = m.cosine_similarities(&[0.0, 0.0]);
        assert_eq!(scores, vec![0.0, 0.0]);
        let scores = m.cosine_similarities(&[1.0, 1.0]);
        assert_eq!(scores[0], 0.0);
        assert!(approx(scores[1], 1.0));
    }

    #[test]
    fn zero_dimension_matrix_is_empty() {
        let m = EmbeddingMatrix::new(0);
        assert_eq!(m.rows(), 0);
        assert_eq!(m.iter_rows().count(), 0);
        assert!(m.cosine_similarities(&[]).is_empty());
    }
}
