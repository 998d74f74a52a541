mod data_type;
mod fmt;
mod tensor;

#[allow(non_camel_case_types)]
pub type udim = u32;

pub use data_type::DataType;
pub use tensor::{expand_indices, idx_strides, Element, Shape, Tensor};
