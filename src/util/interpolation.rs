// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use ndarray::ArrayView1;

/// Index of the interval in the ascending `xarr` containing `x`, searched between `idx_low` and `idx_high`.
pub(crate) fn bsearch(xarr: &ArrayView1<'_, f32>, x: f32, idx_low: usize, idx_high: usize) -> usize {
	let mut ilow = idx_low;
	let mut ihigh = idx_high;

	while ihigh > ilow + 1 {
		let i = (ihigh + ilow) / 2;
		if xarr[i] > x {
			ihigh = i;
		} else {
			ilow = i;
		}
	}
	ilow
}

/// One-dimensional linear interpolation over ascending sample points `xp` with values `fp`. Values outside the sampled
/// range are clamped to the first/last value.
pub(crate) fn interp(x: f32, xp: ArrayView1<'_, f32>, fp: ArrayView1<'_, f32>) -> f32 {
	debug_assert_eq!(xp.len(), fp.len());
	let last = xp.len() - 1;
	if x <= xp[0] {
		return fp[0];
	}
	if x >= xp[last] {
		return fp[last];
	}

	let idx = bsearch(&xp, x, 0, last);
	let (x_l, x_h) = (xp[idx], xp[idx + 1]);
	let (y_l, y_h) = (fp[idx], fp[idx + 1]);
	let dx = x_h - x_l;
	if dx > 0.0 { y_l + (x - x_l) / dx * (y_h - y_l) } else { y_l }
}
