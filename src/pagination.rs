use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct Pagination {
    /// Page size; non-positive or missing values use the server default.
    #[param(default = 10, maximum = 100)]
    pub limit: Option<i64>,
    #[param(default = 0, minimum = 0)]
    pub offset: Option<u64>,
}

impl Pagination {
    /// Effective `(limit, offset)` given the server's page bounds.
    pub fn resolve(&self, default_size: u64, max_size: u64) -> (u64, u64) {
        let limit = match self.limit {
            Some(l) if l > 0 => (l as u64).min(max_size),
            _ => default_size.min(max_size),
        };
        (limit, self.offset.unwrap_or(0))
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub limit: u64,
    pub offset: u64,
    pub total_items: u64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, total_items: u64, limit: u64, offset: u64) -> Self {
        Self {
            data,
            limit,
            offset,
            total_items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_fall_back_and_clamp() {
        let p = |limit, offset| Pagination { limit, offset };
        assert_eq!(p(None, None).resolve(10, 100), (10, 0));
        assert_eq!(p(Some(0), Some(5)).resolve(10, 100), (10, 5));
        assert_eq!(p(Some(-3), None).resolve(10, 100), (10, 0));
        assert_eq!(p(Some(25), Some(50)).resolve(10, 100), (25, 50));
        assert_eq!(p(Some(1000), None).resolve(10, 100), (100, 0));
    }
}
