use causal_lm::{ParameterTree, Parameters, StructuralMismatch};
use std::sync::Arc;

/// 持有当前模型参数，替换前检查结构。
///
/// 带有适配器时，[`ParameterStore::replace`] 替换的是适配器；否则替换完整参数。
#[derive(Clone, Debug)]
pub struct ParameterStore {
    base: Arc<ParameterTree>,
    adapter: Option<Arc<ParameterTree>>,
}

/// 某一时刻的参数，替换不影响已经取出的快照。
#[derive(Clone, Debug)]
pub struct Snapshot {
    base: Arc<ParameterTree>,
    adapter: Option<Arc<ParameterTree>>,
}

impl Snapshot {
    #[inline]
    pub fn parameters(&self) -> Parameters {
        Parameters {
            base: &self.base,
            adapter: self.adapter.as_deref(),
        }
    }
}

impl ParameterStore {
    #[inline]
    pub fn new(base: ParameterTree) -> Self {
        Self {
            base: Arc::new(base),
            adapter: None,
        }
    }

    #[inline]
    pub fn with_adapter(base: ParameterTree, adapter: ParameterTree) -> Self {
        Self {
            base: Arc::new(base),
            adapter: Some(Arc::new(adapter)),
        }
    }

    #[inline]
    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    /// [`ParameterStore::replace`] 作用的参数树。
    #[inline]
    pub fn current(&self) -> &ParameterTree {
        self.adapter.as_ref().unwrap_or(&self.base)
    }

    #[inline]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            base: self.base.clone(),
            adapter: self.adapter.clone(),
        }
    }

    /// 结构一致时替换，否则保持原状并返回第一个差异。
    pub fn replace(&mut self, tree: ParameterTree) -> Result<(), StructuralMismatch> {
        self.current().check_structure(&tree)?;
        let kind = if self.has_adapter() { "adapter" } else { "base" };
        let target = match &mut self.adapter {
            Some(adapter) => adapter,
            None => &mut self.base,
        };
        *target = Arc::new(tree);
        info!("replaced {kind} parameters ({})", self.current().num_params());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensor::Tensor;

    fn tree(layers: usize, value: f32) -> ParameterTree {
        let mut tree = ParameterTree::new();
        for i in 0..layers {
            tree.insert(&format!("layers.{i}.w"), Tensor::new(&[2], vec![value; 2]));
        }
        tree
    }

    #[test]
    fn test_replace_base() {
        let mut store = ParameterStore::new(tree(4, 0.));
        let old = store.snapshot();
        store.replace(tree(4, 1.)).unwrap();
        assert_eq!(store.current(), &tree(4, 1.));
        // 已经取出的快照不受影响
        assert_eq!(old.parameters().base, &tree(4, 0.));

        let err = store.replace(tree(6, 2.)).unwrap_err();
        assert!(err.to_string().contains("must have the same structure"));
        assert_eq!(store.current(), &tree(4, 1.));
    }

    #[test]
    fn test_replace_adapter() {
        let mut store = ParameterStore::with_adapter(tree(4, 0.), tree(2, 0.));
        assert!(store.has_adapter());
        // 适配器的结构与完整参数无关
        assert!(store.replace(tree(4, 1.)).is_err());
        store.replace(tree(2, 1.)).unwrap();
        let snapshot = store.snapshot();
        let params = snapshot.parameters();
        assert_eq!(params.base, &tree(4, 0.));
        assert_eq!(params.adapter, Some(&tree(2, 1.)));
    }
}
