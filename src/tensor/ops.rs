//! # Tensor Operations
//!
//! Small slice-level helpers shared by the convolution and pooling layers.

use super::{Cube, TensorData};
use ndarray::{s, ArrayBase, ArrayView2, ArrayView3, ArrayViewMut2, Axis, Data, Dimension, Zip};

/// Spatially flips a filter along both axes, as a view.
pub fn rotate180(filter: ArrayView2<'_, TensorData>) -> ArrayView2<'_, TensorData> {
    filter.slice_move(s![..;-1, ..;-1])
}

/// Rotates every slice of a filter bank by 180 degrees.
pub fn rotate180_cube(filters: ArrayView3<'_, TensorData>) -> Cube {
    let mut rotated = Cube::zeros(filters.raw_dim());
    for (mut dst, src) in rotated.axis_iter_mut(Axis(0)).zip(filters.axis_iter(Axis(0))) {
        dst.assign(&rotate180(src));
    }
    rotated
}

/// Adds `src[offset + (i, j)]` into `dst[(i, j)]` over the region both tensors cover.
///
/// With a zero offset this is the top-left overlap rule: a larger `src` only
/// contributes its top-left `dst`-sized block, a smaller one lands in the
/// top-left corner of `dst`.
pub fn add_overlap(
    mut dst: ArrayViewMut2<'_, TensorData>,
    src: ArrayView2<'_, TensorData>,
    offset: (usize, usize),
) {
    let (dst_rows, dst_cols) = dst.dim();
    let (src_rows, src_cols) = src.dim();
    let rows = dst_rows.min(src_rows.saturating_sub(offset.0));
    let cols = dst_cols.min(src_cols.saturating_sub(offset.1));
    if rows == 0 || cols == 0 {
        return;
    }
    let window = src.slice(s![offset.0..offset.0 + rows, offset.1..offset.1 + cols]);
    let mut target = dst.slice_mut(s![..rows, ..cols]);
    target += &window;
}

/// Frobenius inner product of two equally shaped tensors.
pub fn inner<S1, S2, D>(a: &ArrayBase<S1, D>, b: &ArrayBase<S2, D>) -> TensorData
where
    S1: Data<Elem = TensorData>,
    S2: Data<Elem = TensorData>,
    D: Dimension,
{
    Zip::from(a).and(b).fold(0.0, |acc, &x, &y| acc + x * y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array2};

    #[test]
    fn rotate180_reverses_both_axes() {
        let f = arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        assert_eq!(rotate180(f.view()), arr2(&[[6.0, 5.0], [4.0, 3.0], [2.0, 1.0]]));
    }

    #[test]
    fn add_overlap_crops_larger_source() {
        let mut dst = Array2::<TensorData>::zeros((2, 2));
        let src = Array2::from_shape_fn((3, 4), |(i, j)| (i * 4 + j) as TensorData);
        add_overlap(dst.view_mut(), src.view(), (0, 0));
        assert_eq!(dst, arr2(&[[0.0, 1.0], [4.0, 5.0]]));
    }

    #[test]
    fn add_overlap_fills_top_left_of_larger_destination() {
        let mut dst = Array2::<TensorData>::ones((3, 3));
        let src = arr2(&[[2.0, 3.0]]);
        add_overlap(dst.view_mut(), src.view(), (0, 0));
        assert_eq!(dst, arr2(&[[3.0, 4.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, 1.0]]));
    }

    #[test]
    fn add_overlap_honours_offset() {
        let mut dst = Array2::<TensorData>::zeros((2, 2));
        let src = Array2::from_shape_fn((4, 4), |(i, j)| (i * 4 + j) as TensorData);
        add_overlap(dst.view_mut(), src.view(), (1, 2));
        assert_eq!(dst, arr2(&[[6.0, 7.0], [10.0, 11.0]]));
    }

    #[test]
    fn inner_sums_elementwise_products() {
        let a = arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let b = arr2(&[[0.5, 0.0], [1.0, -1.0]]);
        assert_eq!(inner(&a, &b), -0.5);
    }
}
