//! 解码器各个 crate 共享的基础类型。

mod between_f32;

pub use between_f32::BetweenF32;
pub use half::{bf16, f16};

/// `utok` for token id.
#[allow(non_camel_case_types)]
pub type utok = u32;

/// `upos` for position id.
#[allow(non_camel_case_types)]
pub type upos = u32;

/// 取出按行排布的缓冲区中的第 `line` 行。
#[macro_export]
macro_rules! slice {
    ($blob:expr; $width:expr; [$line:expr]) => {
        $blob[$line as usize * $width as usize..][..$width as usize]
    };
}

/// 返回最大值的序号，`NaN` 按 IEEE 全序比较。有多个最大值时取第一个。
pub fn argmax<T: BetweenF32>(values: &[T]) -> utok {
    values
        .iter()
        .enumerate()
        .rev()
        .max_by(|(_, a), (_, b)| a.get().total_cmp(&b.get()))
        .map_or(0, |(i, _)| i as _)
}

#[test]
fn test_slice() {
    let blob = [0, 1, 2, 3, 4, 5];
    assert_eq!(slice!(blob; 3; [1]), [3, 4, 5]);
    assert_eq!(slice!(blob; 2u32; [2usize]), [4, 5]);
}

#[test]
fn test_argmax() {
    assert_eq!(argmax(&[0.1f32, 3., -2., 2.9]), 1);
    assert_eq!(argmax(&[f16::from_f32(-1.), f16::from_f32(0.5)]), 1);
    assert_eq!(argmax::<f32>(&[]), 0);
    assert_eq!(argmax(&[1f32, 3., 3., 0.]), 1);
}
