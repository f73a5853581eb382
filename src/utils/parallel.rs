//! # Parallelism Utilities (CPU Threading)
//!
//! Slice-level scheduling helpers built on `rayon`. Every helper hands each
//! worker a distinct slice of the tensor being written, so parallel loops never
//! share an output location.

use ndarray::{ArrayViewMut2, ArrayViewMut3, Axis};
use rayon::prelude::*;

use crate::tensor::TensorError;

/// Minimum number of multiply-adds before a loop is split across threads.
pub const PARALLEL_THRESHOLD: usize = 1 << 14;

/// Returns true when `work` multiply-adds are worth distributing.
pub fn should_parallelize(work: usize) -> bool {
    work >= PARALLEL_THRESHOLD && rayon::current_num_threads() > 1
}

/// Runs `op` on every slice of `cube` along axis 0, passing the slice index.
///
/// Slices are processed in parallel when `work_per_slice * slices` crosses
/// [`PARALLEL_THRESHOLD`]. The first error stops the loop and is returned.
pub fn try_for_each_slice<A, F>(
    mut cube: ArrayViewMut3<'_, A>,
    work_per_slice: usize,
    op: F,
) -> Result<(), TensorError>
where
    A: Send + Sync,
    F: Fn(usize, ArrayViewMut2<'_, A>) -> Result<(), TensorError> + Send + Sync,
{
    let slices = cube.len_of(Axis(0));
    if should_parallelize(work_per_slice.saturating_mul(slices)) {
        cube.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .try_for_each(|(index, slice)| op(index, slice))
    } else {
        cube.axis_iter_mut(Axis(0))
            .enumerate()
            .try_for_each(|(index, slice)| op(index, slice))
    }
}

/// Runs `op` inside a dedicated rayon pool of `num_threads` workers.
///
/// `None` uses the global pool.
pub fn with_num_threads<R, F>(num_threads: Option<usize>, op: F) -> Result<R, TensorError>
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    match num_threads {
        None => Ok(op()),
        Some(threads) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| TensorError::InvalidConfiguration(e.to_string()))?;
            log::debug!("running in a scoped pool of {} threads", threads);
            Ok(pool.install(op))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn every_slice_is_visited_once() {
        let mut cube = Array3::<usize>::zeros((64, 16, 16));
        try_for_each_slice(cube.view_mut(), PARALLEL_THRESHOLD, |index, mut slice| {
            slice += index + 1;
            Ok(())
        })
        .unwrap();
        for (index, slice) in cube.axis_iter(Axis(0)).enumerate() {
            assert!(slice.iter().all(|&v| v == index + 1));
        }
    }

    #[test]
    fn errors_propagate() {
        let mut cube = Array3::<f64>::zeros((4, 2, 2));
        let result = try_for_each_slice(cube.view_mut(), 1, |index, _| {
            if index == 2 {
                Err(TensorError::EmptyPoolingStack)
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(TensorError::EmptyPoolingStack)));
    }

    #[test]
    fn scoped_pool_reports_its_size() {
        let threads = with_num_threads(Some(2), rayon::current_num_threads).unwrap();
        assert_eq!(threads, 2);
    }
}
