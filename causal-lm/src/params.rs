use std::{collections::BTreeMap, fmt};
use tensor::{udim, Tensor};

/// 按名字嵌套组织的参数树。
#[derive(Clone, PartialEq, Default, Debug)]
pub struct ParameterTree(BTreeMap<String, ParamNode>);

/// 参数树的节点。
#[derive(Clone, PartialEq, Debug)]
pub enum ParamNode {
    /// 参数张量。
    Leaf(Tensor<f32>),
    /// 子树。
    Branch(ParameterTree),
}

/// 两棵参数树的第一个结构差异，路径以 `.` 连接。
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StructureDiff {
    /// 新树缺少这个节点。
    Missing {
        /// 节点路径。
        path: String,
    },
    /// 新树多出这个节点。
    Unexpected {
        /// 节点路径。
        path: String,
    },
    /// 一边是张量，另一边是子树。
    KindMismatch {
        /// 节点路径。
        path: String,
    },
    /// 张量形状不同。
    Shape {
        /// 节点路径。
        path: String,
        /// 当前形状。
        expected: Vec<udim>,
        /// 新的形状。
        actual: Vec<udim>,
    },
}

impl fmt::Display for StructureDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { path } => write!(f, "`{path}` is missing"),
            Self::Unexpected { path } => write!(f, "`{path}` is unexpected"),
            Self::KindMismatch { path } => {
                write!(f, "`{path}` is a tensor in one tree and a subtree in the other")
            }
            Self::Shape {
                path,
                expected,
                actual,
            } => write!(f, "`{path}` has shape {actual:?}, expected {expected:?}"),
        }
    }
}

/// 替换参数树时结构不一致。
#[derive(thiserror::Error, Clone, PartialEq, Eq, Debug)]
#[error("new parameter tree must have the same structure as the current one: {0}")]
pub struct StructuralMismatch(pub StructureDiff);

impl ParameterTree {
    /// 空树。
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 在 `.` 分隔的路径上插入张量，按需创建中间子树。
    ///
    /// 路径经过已有张量时 panic。
    pub fn insert(&mut self, path: &str, tensor: Tensor<f32>) {
        match path.split_once('.') {
            None => {
                self.0.insert(path.into(), ParamNode::Leaf(tensor));
            }
            Some((head, tail)) => {
                let node = self
                    .0
                    .entry(head.into())
                    .or_insert_with(|| ParamNode::Branch(Self::new()));
                match node {
                    ParamNode::Branch(tree) => tree.insert(tail, tensor),
                    ParamNode::Leaf(_) => panic!("`{head}` is a tensor, cannot insert `{tail}`"),
                }
            }
        }
    }

    /// 按路径取节点。
    pub fn get(&self, path: &str) -> Option<&ParamNode> {
        match path.split_once('.') {
            None => self.0.get(path),
            Some((head, tail)) => match self.0.get(head)? {
                ParamNode::Branch(tree) => tree.get(tail),
                ParamNode::Leaf(_) => None,
            },
        }
    }

    /// 按路径取张量。
    #[inline]
    pub fn leaf(&self, path: &str) -> Option<&Tensor<f32>> {
        match self.get(path)? {
            ParamNode::Leaf(t) => Some(t),
            ParamNode::Branch(_) => None,
        }
    }

    /// 是否为空树。
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 按路径字典序列出所有张量。
    pub fn leaves(&self) -> Vec<(String, &Tensor<f32>)> {
        let mut ans = Vec::new();
        self.collect_leaves("", &mut ans);
        ans
    }

    fn collect_leaves<'a>(&'a self, prefix: &str, ans: &mut Vec<(String, &'a Tensor<f32>)>) {
        for (name, node) in &self.0 {
            let path = join(prefix, name);
            match node {
                ParamNode::Leaf(t) => ans.push((path, t)),
                ParamNode::Branch(tree) => tree.collect_leaves(&path, ans),
            }
        }
    }

    /// 结构不变，逐个变换张量。
    pub fn map_leaves(&self, mut f: impl FnMut(&str, &Tensor<f32>) -> Tensor<f32>) -> Self {
        self.map_inner("", &mut f)
    }

    fn map_inner(
        &self,
        prefix: &str,
        f: &mut impl FnMut(&str, &Tensor<f32>) -> Tensor<f32>,
    ) -> Self {
        Self(
            self.0
                .iter()
                .map(|(name, node)| {
                    let path = join(prefix, name);
                    let node = match node {
                        ParamNode::Leaf(t) => ParamNode::Leaf(f(&path, t)),
                        ParamNode::Branch(tree) => ParamNode::Branch(tree.map_inner(&path, &mut *f)),
                    };
                    (name.clone(), node)
                })
                .collect(),
        )
    }

    /// 参数总数。
    pub fn num_params(&self) -> usize {
        self.leaves().iter().map(|(_, t)| t.size()).sum()
    }

    /// 找到 `other` 与 `self` 的第一个结构差异（键集合或张量形状），值的差异被忽略。
    pub fn structure_diff(&self, other: &Self) -> Option<StructureDiff> {
        self.diff_inner("", other)
    }

    /// 结构一致时返回 `Ok`。
    #[inline]
    pub fn check_structure(&self, other: &Self) -> Result<(), StructuralMismatch> {
        match self.structure_diff(other) {
            Some(diff) => Err(StructuralMismatch(diff)),
            None => Ok(()),
        }
    }

    fn diff_inner(&self, prefix: &str, other: &Self) -> Option<StructureDiff> {
        for (name, node) in &self.0 {
            let path = join(prefix, name);
            let diff = match (node, other.0.get(name)) {
                (_, None) => Some(StructureDiff::Missing { path }),
                (ParamNode::Leaf(a), Some(ParamNode::Leaf(b))) => (a.shape() != b.shape())
                    .then(|| StructureDiff::Shape {
                        path,
                        expected: a.shape().to_vec(),
                        actual: b.shape().to_vec(),
                    }),
                (ParamNode::Branch(a), Some(ParamNode::Branch(b))) => a.diff_inner(&path, b),
                _ => Some(StructureDiff::KindMismatch { path }),
            };
            if diff.is_some() {
                return diff;
            }
        }
        other
            .0
            .keys()
            .find(|name| !self.0.contains_key(*name))
            .map(|name| StructureDiff::Unexpected {
                path: join(prefix, name),
            })
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.into()
    } else {
        format!("{prefix}.{name}")
    }
}
