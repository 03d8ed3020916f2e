//! Real-valued operator kernels.
//!
//! Every kernel takes dequantized `f64` values and returns `f64` values;
//! quantization happens at the executor boundary.

use ndarray::{Array2, Array4, ArrayView2, ArrayView4};

use ethosu_ir::shape::window;
use ethosu_ir::{Conv2dAttrs, FusedActivation, IrError, Pool2dAttrs};

pub(crate) fn clamp(x: f64, act: FusedActivation) -> f64 {
    let (lo, hi) = act.real_range();
    x.clamp(lo, hi)
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// NHWC convolution. `weights` is OHWI for a regular convolution and
/// `[1, KH, KW, C * multiplier]` for a depthwise one.
pub(crate) fn conv2d(
    input: ArrayView4<'_, f64>,
    weights: ArrayView4<'_, f64>,
    bias: Option<&[f64]>,
    attrs: &Conv2dAttrs,
    depthwise: bool,
) -> Result<Array4<f64>, IrError> {
    let (n, h, w, c) = input.dim();
    let (wo, kh, kw, wi) = weights.dim();
    let out_c = if depthwise { wi } else { wo };
    let multiplier = if depthwise { (wi / c.max(1)).max(1) } else { 1 };
    let y = window(h, kh, attrs.stride[0], attrs.dilation[0], attrs.padding)?;
    let x = window(w, kw, attrs.stride[1], attrs.dilation[1], attrs.padding)?;

    let mut out = Array4::<f64>::zeros((n, y.out, x.out, out_c));
    for b in 0..n {
        for oy in 0..y.out {
            for ox in 0..x.out {
                for oc in 0..out_c {
                    let mut acc = bias.and_then(|v| v.get(oc).copied()).unwrap_or(0.0);
                    for ky in 0..kh {
                        let iy = (oy * attrs.stride[0] + ky * attrs.dilation[0]) as isize
                            - y.pad_before as isize;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for kx in 0..kw {
                            let ix = (ox * attrs.stride[1] + kx * attrs.dilation[1]) as isize
                                - x.pad_before as isize;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }
                            let (iy, ix) = (iy as usize, ix as usize);
                            if depthwise {
                                let ic = oc / multiplier;
                                acc += input[[b, iy, ix, ic]] * weights[[0, ky, kx, oc]];
                            } else {
                                for ic in 0..wi {
                                    acc += input[[b, iy, ix, ic]] * weights[[oc, ky, kx, ic]];
                                }
                            }
                        }
                    }
                    out[[b, oy, ox, oc]] = clamp(acc, attrs.activation);
                }
            }
        }
    }
    Ok(out)
}

/// NHWC pooling. Padding elements are excluded from both the maximum and
/// the average.
pub(crate) fn pool2d(
    input: ArrayView4<'_, f64>,
    attrs: &Pool2dAttrs,
    max: bool,
) -> Result<Array4<f64>, IrError> {
    let (n, h, w, c) = input.dim();
    let y = window(h, attrs.kernel[0], attrs.stride[0], 1, attrs.padding)?;
    let x = window(w, attrs.kernel[1], attrs.stride[1], 1, attrs.padding)?;

    let mut out = Array4::<f64>::zeros((n, y.out, x.out, c));
    for b in 0..n {
        for oy in 0..y.out {
            for ox in 0..x.out {
                for ch in 0..c {
                    let mut best = f64::NEG_INFINITY;
                    let mut sum = 0.0;
                    let mut count = 0usize;
                    for ky in 0..attrs.kernel[0] {
                        let iy = (oy * attrs.stride[0] + ky) as isize - y.pad_before as isize;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for kx in 0..attrs.kernel[1] {
                            let ix = (ox * attrs.stride[1] + kx) as isize - x.pad_before as isize;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }
                            let v = input[[b, iy as usize, ix as usize, ch]];
                            best = best.max(v);
                            sum += v;
                            count += 1;
                        }
                    }
                    let v = if max {
                        best
                    } else if count > 0 {
                        sum / count as f64
                    } else {
                        0.0
                    };
                    out[[b, oy, ox, ch]] = clamp(v, attrs.activation);
                }
            }
        }
    }
    Ok(out)
}

/// `input [N, I] x weights [O, I]^T + bias`.
pub(crate) fn fully_connected(
    input: ArrayView2<'_, f64>,
    weights: ArrayView2<'_, f64>,
    bias: Option<&[f64]>,
    activation: FusedActivation,
) -> Array2<f64> {
    let mut out = input.dot(&weights.t());
    for mut row in out.rows_mut() {
        for (o, v) in row.iter_mut().enumerate() {
            *v = clamp(*v + bias.and_then(|b| b.get(o).copied()).unwrap_or(0.0), activation);
        }
    }
    out
}

/// Softmax over the innermost dimension of length `inner`.
pub(crate) fn softmax(values: &mut [f64], inner: usize, beta: f64) {
    if inner == 0 {
        return;
    }
    for row in values.chunks_mut(inner) {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (beta * (*v - max)).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethosu_ir::Padding;
    use ndarray::{Array, array};

    #[test]
    fn conv_same_padding_sums_neighbourhood() {
        let input = Array::from_elem((1, 3, 3, 1), 1.0);
        let weights = Array::from_elem((1, 3, 3, 1), 1.0);
        let attrs = Conv2dAttrs {
            padding: Padding::Same,
            ..Default::default()
        };
        let out = conv2d(input.view(), weights.view(), Some(&[0.5]), &attrs, false).unwrap();
        assert_eq!(out.dim(), (1, 3, 3, 1));
        assert_eq!(out[[0, 0, 0, 0]], 4.5);
        assert_eq!(out[[0, 1, 1, 0]], 9.5);
    }

    #[test]
    fn depthwise_keeps_channels_separate() {
        let mut input = Array4::<f64>::zeros((1, 1, 1, 2));
        input[[0, 0, 0, 0]] = 2.0;
        input[[0, 0, 0, 1]] = 3.0;
        let weights = Array::from_shape_vec((1, 1, 1, 2), vec![10.0, 100.0]).unwrap();
        let out = conv2d(input.view(), weights.view(), None, &Conv2dAttrs::default(), true).unwrap();
        assert_eq!(out.into_raw_vec_and_offset().0, vec![20.0, 300.0]);
    }

    #[test]
    fn pooling_excludes_padding() {
        let input = Array::from_shape_vec((1, 2, 2, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let attrs = Pool2dAttrs::new([3, 3], [1, 1], Padding::Same);
        let avg = pool2d(input.view(), &attrs, false).unwrap();
        assert_eq!(avg[[0, 0, 0, 0]], 2.5);
        let max = pool2d(input.view(), &attrs, true).unwrap();
        assert_eq!(max[[0, 0, 0, 0]], 4.0);
    }

    #[test]
    fn fc_with_bias_and_relu() {
        let input = array![[1.0, -2.0]];
        let weights = array![[1.0, 1.0], [0.0, 1.0]];
        let out = fully_connected(input.view(), weights.view(), Some(&[0.0, 0.5]), FusedActivation::Relu);
        assert_eq!(out, array![[0.0, 0.0]]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut v = vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0];
        softmax(&mut v, 3, 1.0);
        assert!((v[..3].iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((v[3] - 1.0 / 3.0).abs() < 1e-12);
    }
}
