use crate::runmask::Cell;

/// Assign cells to batches in order, the last batch takes the remainder
pub fn assign_cells(cells: &[Cell], per_batch: usize) -> Vec<Vec<Cell>> {
    if per_batch == 0 {
        return Vec::new();
    }

    cells.chunks(per_batch).map(<[Cell]>::to_vec).collect()
}

pub fn batch_count(cells: usize, per_batch: usize) -> usize {
    if per_batch == 0 {
        0
    } else {
        cells.div_ceil(per_batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn cells(count: usize, width: usize) -> Vec<Cell> {
        (0..count)
            .map(|index| Cell {
                y: index / width,
                x: index % width,
            })
            .collect()
    }

    #[test]
    fn every_cell_lands_in_exactly_one_batch() {
        for (count, per_batch) in [(25, 10), (30, 10), (1, 7), (7, 1), (100, 33)] {
            let input = cells(count, 6);
            let batches = assign_cells(&input, per_batch);

            assert_eq!(batches.len(), batch_count(count, per_batch));
            assert!(batches.iter().all(|batch| !batch.is_empty() && batch.len() <= per_batch));

            let flattened = batches.concat();
            assert_eq!(flattened, input, "order must be preserved");
            assert_eq!(
                flattened.iter().collect::<BTreeSet<_>>().len(),
                count,
                "no duplicates"
            );
        }
    }

    #[test]
    fn remainder_becomes_the_last_batch() {
        let batches = assign_cells(&cells(25, 5), 10);

        assert_eq!(
            batches.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![10, 10, 5]
        );
        assert_eq!(batches[2][0], Cell { y: 4, x: 0 });
    }
}
