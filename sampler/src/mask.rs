use tensor::Tensor;

/// 增量解码的注意力掩码，形状为 `batch x 1 x seq_len`。
///
/// `padding` 形状为 `batch x buf_len`，`true` 表示该位置是填充，不能被关注。
/// 第 `k` 列对应绝对位置 `max(time_step + 1 - seq_len, 0) + k`；
/// 窗口内位于 `time_step` 之后的列、以及落在 `padding` 中为 `true` 的列被屏蔽。
///
/// 窗口比已有的位置长时，窗口从位置 0 开始，`time_step` 之后的列为空；
/// 窗口比已有的位置短时，只保留最近 `seq_len` 个位置（滑动窗口）。
pub fn compute_attention_mask(time_step: usize, seq_len: usize, padding: &Tensor<bool>) -> Tensor<bool> {
    let &[batch, buf_len] = padding.shape() else {
        panic!("padding mask must be 2-D, got {:?}", padding.shape());
    };
    let buf_len = buf_len as usize;
    let window = buf_len.min(seq_len);
    let start = (time_step + 1).saturating_sub(seq_len).min(buf_len - window);

    Tensor::from_fn(&[batch, 1, seq_len as _], |idx| {
        let (b, k) = (idx[0], idx[2] as usize);
        let future = k > time_step;
        let padded = k < window && padding.get(&[b, (start + k) as _]);
        !(future || padded)
    })
}

/// 预填充的因果掩码，形状为 `batch x len x target_len`。
///
/// `input_mask` 形状为 `batch x len`，`true` 表示真实的词。
/// `(i, j)` 为真当且仅当 `j <= i` 且第 `j` 个位置是真实的词，`len` 之后的列总为假。
pub fn make_causal_attn_mask(input_mask: &Tensor<bool>, target_len: usize) -> Tensor<bool> {
    let &[batch, len] = input_mask.shape() else {
        panic!("input mask must be 2-D, got {:?}", input_mask.shape());
    };
    assert!(
        target_len >= len as usize,
        "target length {target_len} is shorter than the prompt ({len})"
    );

    Tensor::from_fn(&[batch, len, target_len as _], |idx| {
        let (b, i, j) = (idx[0], idx[1], idx[2]);
        j <= i && j < len && input_mask.get(&[b, j])
    })
}
