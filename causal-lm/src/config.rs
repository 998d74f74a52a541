use serde::{Deserialize, Serialize};

/// KV 缓存的几何形状，构造后不可变。
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawCacheConfig")]
pub struct CacheConfig {
    capacity: usize,
    num_layers: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

/// 缓存配置错误。
#[derive(thiserror::Error, Clone, PartialEq, Eq, Debug)]
pub enum ConfigError {
    /// 某个字段不是正数。
    #[error("invalid configuration: `{field}` must be positive")]
    NonPositive {
        /// 字段名。
        field: &'static str,
    },
    /// 缓存形状与模型不符。
    #[error("invalid configuration: cache `{field}` is {cache} but the model has {model}")]
    ModelMismatch {
        /// 字段名。
        field: &'static str,
        /// 缓存配置中的值。
        cache: usize,
        /// 模型中的值。
        model: usize,
    },
}

#[derive(Deserialize)]
struct RawCacheConfig {
    #[serde(alias = "cache_size")]
    capacity: usize,
    num_layers: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl TryFrom<RawCacheConfig> for CacheConfig {
    type Error = ConfigError;
    #[inline]
    fn try_from(raw: RawCacheConfig) -> Result<Self, Self::Error> {
        Self::new(raw.capacity, raw.num_layers, raw.num_kv_heads, raw.head_dim)
    }
}

impl CacheConfig {
    /// 所有字段都必须为正。
    pub fn new(
        capacity: usize,
        num_layers: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> Result<Self, ConfigError> {
        for (field, value) in [
            ("capacity", capacity),
            ("num_layers", num_layers),
            ("num_kv_heads", num_kv_heads),
            ("head_dim", head_dim),
        ] {
            if value == 0 {
                return Err(ConfigError::NonPositive { field });
            }
        }
        Ok(Self {
            capacity,
            num_layers,
            num_kv_heads,
            head_dim,
        })
    }

    /// 缓存能保存的位置数。
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// 层数。
    #[inline]
    pub const fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// 每层的 kv 头数。
    #[inline]
    pub const fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    /// 每个头的维度。
    #[inline]
    pub const fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// 检查缓存形状能否被模型使用。
    pub fn check_model(
        &self,
        num_layers: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> Result<(), ConfigError> {
        for (field, cache, model) in [
            ("num_layers", self.num_layers, num_layers),
            ("num_kv_heads", self.num_kv_heads, num_kv_heads),
            ("head_dim", self.head_dim, head_dim),
        ] {
            if cache != model {
                return Err(ConfigError::ModelMismatch {
                    field,
                    cache,
                    model,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let config = CacheConfig::new(64, 4, 4, 16).unwrap();
        assert_eq!(config.capacity(), 64);
        assert_eq!(config.head_dim(), 16);
        assert_eq!(
            CacheConfig::new(64, 4, 0, 16),
            Err(ConfigError::NonPositive {
                field: "num_kv_heads"
            })
        );
    }

    #[test]
    fn test_check_model() {
        let config = CacheConfig::new(64, 4, 4, 16).unwrap();
        assert!(config.check_model(4, 4, 16).is_ok());
        let err = config.check_model(6, 4, 16).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid configuration: cache `num_layers` is 4 but the model has 6"
        );
    }

    #[test]
    fn test_serde() {
        let config: CacheConfig = serde_json::from_str(
            r#"{"cache_size": 1024, "num_layers": 4, "num_kv_heads": 4, "head_dim": 16}"#,
        )
        .unwrap();
        assert_eq!(config, CacheConfig::new(1024, 4, 4, 16).unwrap());

        let err = serde_json::from_str::<CacheConfig>(
            r#"{"capacity": 0, "num_layers": 4, "num_kv_heads": 4, "head_dim": 16}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("`capacity` must be positive"));
    }
}
