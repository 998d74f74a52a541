/// 可以和 f32 双向转换的标量，采样时统一按 f32 比较。
pub trait BetweenF32: Copy {
    /// 将 f32 转换为 Self。
    fn cast(f: f32) -> Self;
    /// 将 Self 转换为 f32。
    fn get(&self) -> f32;
}

impl BetweenF32 for f32 {
    #[inline]
    fn cast(f: f32) -> Self {
        f
    }
    #[inline]
    fn get(&self) -> f32 {
        *self
    }
}

macro_rules! half_impl {
    ($($ty:ty)+) => {
        $(
            impl BetweenF32 for $ty {
                #[inline]
                fn cast(f: f32) -> Self {
                    <$ty>::from_f32(f)
                }
                #[inline]
                fn get(&self) -> f32 {
                    self.to_f32()
                }
            }
        )+
    };
}

half_impl!(half::f16 half::bf16);

#[test]
fn test_cast() {
    assert_eq!(half::f16::cast(0.5).get(), 0.5);
    assert_eq!(half::bf16::cast(-2.).get(), -2.);
    assert_eq!(f32::cast(1.25), 1.25);
}
