//! Operation kernels of the simulator.
//!
//! Feature maps are HWC. Every kernel produces one accumulator per OFM
//! element and hands it to the output stage.

use ethosu_backend_core::DeviceError;
use ethosu_backend_core::command::{ElementwiseOp, FeatureMap, PoolMode, Scale};
use ethosu_backend_core::numeric::{SCALE_RECORD_BYTES, ScaleRecord, WeightLayout, rescale};

use crate::{Machine, malformed};

/// Input coordinate for output position `o` and kernel tap `k`, or
/// `None` when the tap falls into padding.
fn tap(o: u32, k: u16, stride: u8, dilation: u8, pad: u8, extent: u32) -> Option<usize> {
    let i = o as i64 * stride as i64 + k as i64 * dilation as i64 - pad as i64;
    (0..extent as i64).contains(&i).then_some(i as usize)
}

/// `value << shift`, or `None` when the result leaves the i64 range.
fn pre_shift(value: i64, shift: u8) -> Option<i64> {
    if shift >= 64 {
        return None;
    }
    i64::try_from((value as i128) << shift).ok()
}

fn index(fm: &FeatureMap, y: usize, x: usize, c: usize) -> usize {
    (y * fm.width as usize + x) * fm.depth as usize + c
}

impl Machine {
    pub(crate) fn convolution(&mut self, depthwise: bool) -> Result<(), DeviceError> {
        let (ifm, ofm) = (self.ifm()?, self.ofm()?);
        let kernel = self.regs.kernel;
        let pad = self.regs.padding;

        let multiplier = if depthwise {
            if ifm.depth == 0 || ofm.depth % ifm.depth != 0 {
                return Err(malformed(format!(
                    "depthwise OFM depth {} is not a multiple of IFM depth {}",
                    ofm.depth, ifm.depth
                )));
            }
            (ofm.depth / ifm.depth) as usize
        } else {
            1
        };
        let layout = WeightLayout {
            ofm_depth: ofm.depth as usize,
            kernel_height: kernel.height as usize,
            kernel_width: kernel.width as usize,
            ifm_depth: if depthwise { 1 } else { ifm.depth as usize },
            block_depth: self.block_depth,
        };

        let weights_window = self
            .regs
            .weights
            .ok_or_else(|| malformed("convolution issued before SET_WEIGHTS"))?;
        let weights = self.constants(weights_window)?;
        if weights.len() != layout.len() {
            return Err(malformed(format!(
                "weight stream holds {} byte(s), kernel needs {}",
                weights.len(),
                layout.len()
            )));
        }
        let scales_window = self
            .regs
            .scales
            .ok_or_else(|| malformed("convolution issued before SET_SCALE"))?;
        let records = self
            .constants(scales_window)?
            .chunks_exact(SCALE_RECORD_BYTES)
            .filter_map(ScaleRecord::from_bytes)
            .collect::<Vec<_>>();
        if records.len() < ofm.depth as usize {
            return Err(malformed(format!(
                "{} scale record(s) for {} output channel(s)",
                records.len(),
                ofm.depth
            )));
        }

        let input = self.memory.load(&ifm)?;
        let stage = self.output_stage(&ofm)?;
        let zp = ifm.zero_point as i64;
        let mut out = Vec::with_capacity(ofm.elements());
        for oy in 0..ofm.height {
            for ox in 0..ofm.width {
                for oc in 0..ofm.depth as usize {
                    let record = records[oc];
                    let mut acc = record.bias;
                    for ky in 0..kernel.height {
                        let Some(iy) = tap(oy, ky, kernel.stride[0], kernel.dilation[0], pad.top, ifm.height) else {
                            continue;
                        };
                        for kx in 0..kernel.width {
                            let Some(ix) = tap(ox, kx, kernel.stride[1], kernel.dilation[1], pad.left, ifm.width)
                            else {
                                continue;
                            };
                            let (ky, kx) = (ky as usize, kx as usize);
                            if depthwise {
                                let x = input[index(&ifm, iy, ix, oc / multiplier)] - zp;
                                let w = weights[layout.offset(oc, ky, kx, 0)] as i8 as i64;
                                acc += x * w;
                            } else {
                                for ic in 0..layout.ifm_depth {
                                    let x = input[index(&ifm, iy, ix, ic)] - zp;
                                    let w = weights[layout.offset(oc, ky, kx, ic)] as i8 as i64;
                                    acc += x * w;
                                }
                            }
                        }
                    }
                    let scale = Scale {
                        multiplier: record.multiplier,
                        shift: record.shift,
                    };
                    out.push(stage.apply(acc, scale)?);
                }
            }
        }
        self.memory.store(&ofm, &out)
    }

    pub(crate) fn pool(&mut self, mode: PoolMode) -> Result<(), DeviceError> {
        let (ifm, ofm) = (self.ifm()?, self.ofm()?);
        if ifm.depth != ofm.depth {
            return Err(malformed(format!(
                "pooling changes depth from {} to {}",
                ifm.depth, ofm.depth
            )));
        }
        let kernel = self.regs.kernel;
        let pad = self.regs.padding;
        let scale = self.regs.ofm_scale;
        let input = self.memory.load(&ifm)?;
        let stage = self.output_stage(&ofm)?;
        let zp = ifm.zero_point as i64;

        let mut out = Vec::with_capacity(ofm.elements());
        for oy in 0..ofm.height {
            for ox in 0..ofm.width {
                for c in 0..ofm.depth as usize {
                    let mut max: Option<i64> = None;
                    let mut sum = 0i64;
                    for ky in 0..kernel.height {
                        let Some(iy) = tap(oy, ky, kernel.stride[0], 1, pad.top, ifm.height) else {
                            continue;
                        };
                        for kx in 0..kernel.width {
                            let Some(ix) = tap(ox, kx, kernel.stride[1], 1, pad.left, ifm.width) else {
                                continue;
                            };
                            let x = input[index(&ifm, iy, ix, c)] - zp;
                            sum += x;
                            max = Some(max.map_or(x, |m| m.max(x)));
                        }
                    }
                    let acc = match mode {
                        PoolMode::Max => max.unwrap_or(0),
                        PoolMode::Average | PoolMode::Identity => sum,
                    };
                    out.push(stage.apply(acc, scale)?);
                }
            }
        }
        self.memory.store(&ofm, &out)
    }

    pub(crate) fn elementwise(&mut self, op: ElementwiseOp, left_shift: u8) -> Result<(), DeviceError> {
        let (ifm, ifm2, ofm) = (self.ifm()?, self.ifm2()?, self.ofm()?);
        if ifm.elements() != ofm.elements() || ifm2.elements() != ofm.elements() {
            return Err(malformed(format!(
                "element-wise operands hold {} and {} element(s), OFM {}",
                ifm.elements(),
                ifm2.elements(),
                ofm.elements()
            )));
        }
        let (sa, sb) = (self.regs.ifm_scale, self.regs.ifm2_scale);
        let scale = self.regs.ofm_scale;
        let a = self.memory.load(&ifm)?;
        let b = self.memory.load(&ifm2)?;
        let stage = self.output_stage(&ofm)?;
        let (za, zb) = (ifm.zero_point as i64, ifm2.zero_point as i64);

        let overflow = || malformed(format!("{op:?} with left shift {left_shift} overflows the accumulator"));
        let out = a
            .iter()
            .zip(&b)
            .map(|(&x, &y)| {
                let x = pre_shift(x - za, left_shift).ok_or_else(overflow)?;
                let y = pre_shift(y - zb, left_shift).ok_or_else(overflow)?;
                let x = rescale(x, sa.multiplier, sa.shift);
                let y = rescale(y, sb.multiplier, sb.shift);
                let acc = match op {
                    ElementwiseOp::Add => x.checked_add(y),
                    ElementwiseOp::Sub => x.checked_sub(y),
                    ElementwiseOp::Mul => x.checked_mul(y),
                }
                .ok_or_else(overflow)?;
                stage.apply(acc, scale)
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.memory.store(&ofm, &out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taps_skip_padding() {
        // Output 0 with one row of padding reads rows -1, 0, 1.
        assert_eq!(tap(0, 0, 1, 1, 1, 4), None);
        assert_eq!(tap(0, 1, 1, 1, 1, 4), Some(0));
        assert_eq!(tap(3, 2, 1, 1, 1, 4), None);
        // Stride 2, dilation 2.
        assert_eq!(tap(1, 1, 2, 2, 0, 8), Some(4));
    }

    #[test]
    fn pre_shift_detects_overflow() {
        assert_eq!(pre_shift(-3, 20), Some(-3 << 20));
        assert_eq!(pre_shift(1, 63), None);
        assert_eq!(pre_shift(-1, 63), Some(i64::MIN));
        assert_eq!(pre_shift(1, 64), None);
        assert_eq!(pre_shift(0, 200), None);
    }
}
