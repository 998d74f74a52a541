use crate::{expand_indices, idx_strides, udim, Element, Tensor};
use itertools::Itertools;
use std::fmt;

fn write_matrix<T: fmt::Display>(
    to: &mut fmt::Formatter<'_>,
    buf: &[T],
    shape: (usize, usize),
) -> fmt::Result {
    let (rows, cols) = shape;
    for r in 0..rows {
        for it in &buf[r * cols..][..cols] {
            write!(to, "{it:>9} ")?;
        }
        writeln!(to)?;
    }
    Ok(())
}

impl<T: Element + fmt::Display> fmt::Display for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buf = self.as_slice();
        match self.shape() {
            [] => {
                writeln!(f, "<>")?;
                write_matrix(f, buf, (1, 1))
            }
            [len] => {
                writeln!(f, "<{len}>")?;
                write_matrix(f, buf, (*len as usize, 1))
            }
            [rows, cols] => {
                writeln!(f, "<{rows}x{cols}>")?;
                write_matrix(f, buf, (*rows as usize, *cols as usize))
            }
            [batch @ .., rows, cols] => {
                let (n, idx_strides) = idx_strides(batch);
                let (r, c) = (*rows as usize, *cols as usize);
                for i in 0..n {
                    let indices = expand_indices(i, &idx_strides);
                    writeln!(
                        f,
                        "<{rows}x{cols}>[{}]",
                        indices.iter().map(udim::to_string).join(", "),
                    )?;
                    write_matrix(f, &buf[i * r * c..][..r * c], (r, c))?;
                }
                Ok(())
            }
        }
    }
}

#[test]
fn test_fmt() {
    let t = Tensor::from_fn(&[2, 2, 3], |idx| (idx[0] * 6 + idx[1] * 3 + idx[2]) as f32);
    let text = t.to_string();
    println!("{text}");
    assert!(text.contains("<2x3>[0]"));
    assert!(text.contains("<2x3>[1]"));

    let mask = Tensor::new(&[2], vec![true, false]);
    assert_eq!(mask.to_string().lines().count(), 3);
}
