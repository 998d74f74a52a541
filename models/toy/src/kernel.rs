use common::{slice, upos};
use gemm::{gemm, Parallelism};
use itertools::izip;

/// o = w * x / rms(x)，逐行进行。
///
/// - o, x: [n, d]
/// - w:    [d]
pub fn rms_norm(o: &mut [f32], x: &[f32], w: &[f32], epsilon: f32) {
    let d = w.len();
    assert_eq!(o.len(), x.len());
    assert_eq!(x.len() % d, 0);

    for (o, x) in o.chunks_exact_mut(d).zip(x.chunks_exact(d)) {
        // (Σx^2 / n + δ)^(-1/2)
        let sum = x.iter().map(|x| x * x).sum::<f32>();
        let k = (sum / d as f32 + epsilon).sqrt().recip();
        izip!(o, x, w).for_each(|(o, x, w)| *o = w * (k * x));
    }
}

/// 对一个词的所有头原地施加旋转位置编码，相邻两个元素为一组。
///
/// - t: [nh, dh]
pub fn rotary_embedding(t: &mut [f32], dh: usize, pos: upos, theta: f32) {
    assert_eq!(dh % 2, 0);
    assert_eq!(t.len() % dh, 0);
    let pos = pos as f32;
    let half = dh / 2;
    for head in t.chunks_exact_mut(dh) {
        for (k, pair) in head.chunks_exact_mut(2).enumerate() {
            let freq = pos / theta.powf(k as f32 / half as f32);
            let (sin, cos) = freq.sin_cos();
            let (a, b) = (pair[0], pair[1]);
            pair[0] = a * cos - b * sin;
            pair[1] = a * sin + b * cos;
        }
    }
}

/// gate = silu(gate) * up
pub fn swiglu(gate: &mut [f32], up: &[f32]) {
    assert_eq!(gate.len(), up.len());

    #[inline(always)]
    fn sigmoid(x: f32) -> f32 {
        1. / (1. + (-x).exp())
    }

    for (gate, up) in gate.iter_mut().zip(up) {
        let x = *gate;
        *gate = x * sigmoid(x) * up;
    }
}

/// 原地 softmax。空切片保持不变。
pub fn softmax(x: &mut [f32]) {
    let Some(max) = x.iter().copied().reduce(f32::max) else {
        return;
    };
    let sum = x
        .iter_mut()
        .map(|x| {
            *x = (*x - max).exp();
            *x
        })
        .sum::<f32>();
    x.iter_mut().for_each(|x| *x /= sum);
}

/// c = beta * c + alpha * a x b
///
/// - c: [m, n]
/// - a: [m, k]
/// - b: [k, n]
pub fn mat_mul(c: &mut [f32], beta: f32, a: &[f32], b: &[f32], alpha: f32, [m, k, n]: [usize; 3]) {
    assert_eq!(c.len(), m * n);
    assert_eq!(a.len(), m * k);
    assert_eq!(b.len(), k * n);
    if m == 0 || n == 0 {
        return;
    }
    if k == 0 {
        c.iter_mut().for_each(|c| *c *= beta);
        return;
    }
    unsafe {
        gemm(
            m,
            n,
            k,
            c.as_mut_ptr(),
            1,
            n as _,
            beta != 0.,
            a.as_ptr(),
            1,
            k as _,
            b.as_ptr(),
            1,
            n as _,
            beta,
            alpha,
            false,
            false,
            false,
            Parallelism::None,
        )
    }
}

/// 按词 id 取出词嵌入。
///
/// - x:     [n, d]
/// - table: [voc, d]
pub fn gather(x: &mut [f32], table: &[f32], tokens: &[u32]) {
    assert_eq!(x.len() % tokens.len().max(1), 0);
    let d = x.len() / tokens.len().max(1);
    for (dst, &tok) in x.chunks_exact_mut(d).zip(tokens) {
        dst.copy_from_slice(&slice!(table; d; [tok]));
    }
}
