use crate::{udim, DataType};
use smallvec::SmallVec;

pub type Shape = SmallVec<[udim; 4]>;

/// 可以作为张量元素的标量类型。
pub trait Element: Copy + Default + Send + Sync + 'static {
    const DATA_TYPE: DataType;
}

macro_rules! element {
    ($($ty:ty => $dt:ident)+) => {
        $(
            impl Element for $ty {
                const DATA_TYPE: DataType = DataType::$dt;
            }
        )+
    };
}

element! {
    bool       => Bool
    i8         => I8
    i16        => I16
    i32        => I32
    i64        => I64
    u8         => U8
    u16        => U16
    u32        => U32
    u64        => U64
    half::f16  => F16
    half::bf16 => BF16
    f32        => F32
    f64        => F64
}

/// 连续存储、行优先的稠密张量。
#[derive(Clone, PartialEq, Debug)]
pub struct Tensor<T> {
    shape: Shape,
    data: Vec<T>,
}

impl<T: Element> Tensor<T> {
    #[inline]
    pub fn new(shape: &[udim], data: Vec<T>) -> Self {
        let (size, _) = idx_strides(shape);
        assert_eq!(
            data.len(),
            size,
            "data length {} does not match shape {shape:?}",
            data.len()
        );
        Self {
            shape: Shape::from_slice(shape),
            data,
        }
    }

    #[inline]
    pub fn zeros(shape: &[udim]) -> Self {
        let (size, _) = idx_strides(shape);
        Self::new(shape, vec![T::default(); size])
    }

    /// 按多维下标逐个生成元素。
    pub fn from_fn(shape: &[udim], mut f: impl FnMut(&[udim]) -> T) -> Self {
        let (size, idx_strides) = idx_strides(shape);
        let data = (0..size)
            .map(|i| f(&expand_indices(i, &idx_strides)))
            .collect();
        Self::new(shape, data)
    }

    #[inline]
    pub const fn data_type(&self) -> DataType {
        T::DATA_TYPE
    }

    /// 数据占用的字节数。
    #[inline]
    pub fn bytes_len(&self) -> usize {
        self.size() * T::DATA_TYPE.size()
    }

    #[inline]
    pub fn shape(&self) -> &[udim] {
        &self.shape
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    #[inline]
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    #[inline]
    pub fn reshape(self, shape: &[udim]) -> Self {
        Self::new(shape, self.data)
    }

    #[inline]
    pub fn get(&self, indices: &[udim]) -> T {
        self.data[self.offset(indices)]
    }

    #[inline]
    pub fn get_mut(&mut self, indices: &[udim]) -> &mut T {
        let offset = self.offset(indices);
        &mut self.data[offset]
    }

    /// 取第 0 维的第 `i` 个子张量。
    pub fn select(&self, i: udim) -> Self {
        let (&d, tail) = self.shape.split_first().expect("cannot select from a scalar");
        assert!(i < d, "index {i} out of bound {d}");
        let (len, _) = idx_strides(tail);
        Self::new(tail, self.data[i as usize * len..][..len].to_vec())
    }

    /// 移除长度为 1 的维度。
    pub fn squeeze(mut self, axis: usize) -> Self {
        assert_eq!(self.shape[axis], 1, "cannot squeeze axis {axis} of {:?}", self.shape);
        self.shape.remove(axis);
        self
    }

    pub fn map<U: Element>(&self, f: impl FnMut(T) -> U) -> Tensor<U> {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().copied().map(f).collect(),
        }
    }

    /// 沿第 0 维拼接，其余维度必须一致。
    pub fn concat0(parts: &[Self]) -> Self {
        let (first, rest) = parts.split_first().expect("nothing to concat");
        let tail = &first.shape[1..];
        let mut d = first.shape[0];
        let mut data = first.data.clone();
        for part in rest {
            assert_eq!(&part.shape[1..], tail, "concat shape mismatch");
            d += part.shape[0];
            data.extend_from_slice(&part.data);
        }
        let mut shape = first.shape.clone();
        shape[0] = d;
        Self { shape, data }
    }

    fn offset(&self, indices: &[udim]) -> usize {
        assert_eq!(indices.len(), self.shape.len(), "rank mismatch");
        let (_, strides) = idx_strides(&self.shape);
        indices
            .iter()
            .zip(&self.shape)
            .zip(strides)
            .map(|((&i, &d), s)| {
                assert!(i < d, "index {i} out of bound {d}");
                i as usize * s
            })
            .sum()
    }
}

impl Tensor<f32> {
    /// `|a - b| <= atol + rtol * |b|` 对所有元素成立。
    pub fn all_close(&self, other: &Self, atol: f32, rtol: f32) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| (a - b).abs() <= atol + rtol * b.abs())
    }
}

/// 返回元素总数和各维度的下标步长。
pub fn idx_strides(shape: &[udim]) -> (usize, Vec<usize>) {
    let mut strides = vec![1; shape.len()];
    for i in (1..shape.len()).rev() {
        strides[i - 1] = strides[i] * shape[i] as usize;
    }
    let size = shape.first().map_or(1, |&d| d as usize * strides[0]);
    (size, strides)
}

/// 将线性序号展开为多维下标。
pub fn expand_indices(i: usize, idx_strides: &[usize]) -> Shape {
    let mut rem = i;
    idx_strides
        .iter()
        .map(|&s| {
            let idx = rem / s;
            rem %= s;
            idx as udim
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index() {
        let t = Tensor::from_fn(&[2, 3, 4], |idx| idx[0] * 100 + idx[1] * 10 + idx[2]);
        assert_eq!(t.size(), 24);
        assert_eq!(t.data_type(), DataType::U32);
        assert_eq!(t.get(&[1, 2, 3]), 123);
        assert_eq!(t.as_slice()[13], 101);

        let s = t.select(1);
        assert_eq!(s.shape(), &[3, 4]);
        assert_eq!(s.get(&[0, 1]), 101);
    }

    #[test]
    fn test_reshape_squeeze() {
        let t = Tensor::<f32>::zeros(&[2, 1, 3]).squeeze(1);
        assert_eq!(t.shape(), &[2, 3]);
        let t = t.reshape(&[3, 2]);
        assert_eq!(t.shape(), &[3, 2]);
    }

    #[test]
    #[should_panic]
    fn test_bad_length() {
        let _ = Tensor::new(&[2, 2], vec![0f32; 3]);
    }

    #[test]
    fn test_concat() {
        let a = Tensor::new(&[1, 2], vec![1u32, 2]);
        let b = Tensor::new(&[2, 2], vec![3u32, 4, 5, 6]);
        let c = Tensor::concat0(&[a, b]);
        assert_eq!(c.shape(), &[3, 2]);
        assert_eq!(c.as_slice(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_all_close() {
        let a = Tensor::new(&[3], vec![1., 2., 3.]);
        let b = Tensor::new(&[3], vec![1.05, 2., 3.2]);
        assert!(a.all_close(&b, 0.1, 0.1));
        assert!(!a.all_close(&b, 0.01, 0.01));
        assert!(!a.all_close(&Tensor::zeros(&[1, 3]), 1., 1.));
    }
}
