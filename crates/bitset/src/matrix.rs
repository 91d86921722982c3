use std::fmt::Debug;
use std::marker::PhantomData;

use crate::BitSet;

/// A matrix of bits with lazily allocated rows: rows that contain no bit
/// take no space. Row and column are independently typed dense indices.
#[derive(Clone)]
pub struct SparseBitMatrix<R, C> {
    num_columns: usize,
    rows: Vec<Option<BitSet<C>>>,
    marker: PhantomData<R>,
}

impl<R, C: From<usize> + Into<usize> + Copy + PartialEq + Debug> PartialEq for SparseBitMatrix<R, C> {
    fn eq(&self, other: &Self) -> bool {
        self.num_columns == other.num_columns && self.rows == other.rows
    }
}

impl<R, C: From<usize> + Into<usize> + Copy + PartialEq + Debug> Eq for SparseBitMatrix<R, C> {}

impl<R, C> SparseBitMatrix<R, C>
where
    R: From<usize> + Into<usize> + Copy + PartialEq + Debug,
    C: From<usize> + Into<usize> + Copy + PartialEq + Debug,
{
    pub fn new(num_rows: usize, num_columns: usize) -> Self {
        let mut rows = Vec::new();
        rows.resize_with(num_rows, || None);
        SparseBitMatrix { num_columns, rows, marker: PhantomData }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    /// Returns the row, materializing an empty set if it was never touched.
    pub fn ensure_row(&mut self, row: R) -> &mut BitSet<C> {
        let num_columns = self.num_columns;
        self.rows[row.into()].get_or_insert_with(|| BitSet::new_empty(num_columns))
    }

    pub fn row(&self, row: R) -> Option<&BitSet<C>> {
        self.rows[row.into()].as_ref()
    }

    /// Returns `true` if the matrix changed.
    pub fn insert(&mut self, row: R, column: C) -> bool {
        self.ensure_row(row).insert(column)
    }

    pub fn contains(&self, row: R, column: C) -> bool {
        self.row(row).map_or(false, |r| r.contains(column))
    }

    /// Unions `with` into `row`. Returns `true` if the row changed.
    pub fn union_into_row(&mut self, row: R, with: &BitSet<C>) -> bool {
        self.ensure_row(row).union(with)
    }

    /// Intersects every allocated row with `keep`.
    pub fn intersect_rows(&mut self, keep: &SparseBitMatrix<R, C>) {
        for (idx, row) in self.rows.iter_mut().enumerate() {
            if let Some(row) = row {
                match keep.rows[idx].as_ref() {
                    Some(keep_row) => {
                        row.intersect(keep_row);
                    }
                    None => row.clear(),
                }
            }
        }
    }

    /// Indices of rows that have at least one allocated bit set.
    pub fn rows(&self) -> impl Iterator<Item = R> + '_ {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.as_ref().map_or(false, |row| !row.is_empty()))
            .map(|(idx, _)| R::from(idx))
    }

    pub fn iter(&self, row: R) -> impl Iterator<Item = C> + '_ {
        self.row(row).into_iter().flat_map(BitSet::iter)
    }
}

impl<R, C> Debug for SparseBitMatrix<R, C>
where
    R: From<usize> + Into<usize> + Copy + PartialEq + Debug,
    C: From<usize> + Into<usize> + Copy + PartialEq + Debug,
{
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let entries = self
            .rows
            .iter()
            .enumerate()
            .filter_map(|(idx, row)| row.as_ref().map(|row| (idx, row)));
        fmt.debug_map().entries(entries).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazily_allocated_rows() {
        let mut matrix: SparseBitMatrix<usize, usize> = SparseBitMatrix::new(8, 100);
        assert!(matrix.row(3).is_none());
        assert!(matrix.insert(3, 99));
        assert!(!matrix.insert(3, 99));
        assert!(matrix.contains(3, 99));
        assert!(!matrix.contains(4, 99));
        assert_eq!(matrix.rows().collect::<Vec<_>>(), vec![3]);
        assert_eq!(matrix.iter(3).collect::<Vec<_>>(), vec![99]);
    }

    #[test]
    fn union_into_row() {
        let mut matrix: SparseBitMatrix<usize, usize> = SparseBitMatrix::new(2, 10);
        let mut set = BitSet::new_empty(10);
        set.insert(1);
        set.insert(7);
        assert!(matrix.union_into_row(0, &set));
        assert!(!matrix.union_into_row(0, &set));
        assert_eq!(matrix.iter(0).collect::<Vec<_>>(), vec![1, 7]);
    }
}
