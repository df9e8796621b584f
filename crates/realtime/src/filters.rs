use std::fmt;

/// データベース変更に対するフィルター条件
///
/// Rendered in the PostgREST-style form the Realtime server expects,
/// e.g. `user_id=eq.8d0f…`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseFilter {
    /// フィルター対象のカラム名
    pub column: String,
    /// 比較演算子
    pub operator: FilterOperator,
    /// 比較する値
    pub value: String,
}

impl DatabaseFilter {
    pub fn new(column: &str, operator: FilterOperator, value: &str) -> Self {
        Self {
            column: column.to_string(),
            operator,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for DatabaseFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}.{}", self.column, self.operator, self.value)
    }
}

/// フィルター演算子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Eq,
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FilterOperator::Eq => "eq",
        })
    }
}
