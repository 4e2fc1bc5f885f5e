//! Report filter payloads

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A scalar inside a filter slot.
///
/// `Integer` only exists on the way out: JSON numbers always decode as
/// `Number`, so an integer widens to `f64` after a round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, from = "WireValue")]
pub enum FilterValue {
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<WireValue> for FilterValue {
    fn from(value: WireValue) -> Self {
        match value {
            WireValue::Bool(b) => FilterValue::Bool(b),
            WireValue::Number(n) => FilterValue::Number(n),
            WireValue::Text(s) => FilterValue::Text(s),
        }
    }
}

impl FilterValue {
    /// The value a decoder sees after this one is encoded
    pub fn widened(&self) -> FilterValue {
        match self {
            FilterValue::Integer(i) => FilterValue::Number(*i as f64),
            other => other.clone(),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        FilterValue::Integer(value)
    }
}

impl From<f64> for FilterValue {
    fn from(value: f64) -> Self {
        FilterValue::Number(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        FilterValue::Bool(value)
    }
}

/// Operator slots for one field. Empty slots are omitted, so the zero value
/// encodes as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterCondition {
    #[serde(rename = "eq", skip_serializing_if = "Vec::is_empty")]
    pub equals: Vec<FilterValue>,
    #[serde(rename = "gt", skip_serializing_if = "Vec::is_empty")]
    pub greater_than: Vec<FilterValue>,
    #[serde(rename = "gte", skip_serializing_if = "Vec::is_empty")]
    pub greater_or_equal: Vec<FilterValue>,
    #[serde(rename = "lt", skip_serializing_if = "Vec::is_empty")]
    pub less_than: Vec<FilterValue>,
    #[serde(rename = "lte", skip_serializing_if = "Vec::is_empty")]
    pub less_or_equal: Vec<FilterValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub between: Vec<FilterValue>,
    #[serde(rename = "in", skip_serializing_if = "Vec::is_empty")]
    pub one_of: Vec<FilterValue>,
    #[serde(rename = "nin", skip_serializing_if = "Vec::is_empty")]
    pub not_in: Vec<FilterValue>,
}

impl FilterCondition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, value: impl Into<FilterValue>) -> Self {
        self.equals.push(value.into());
        self
    }

    pub fn greater_than(mut self, value: impl Into<FilterValue>) -> Self {
        self.greater_than.push(value.into());
        self
    }

    pub fn greater_or_equal(mut self, value: impl Into<FilterValue>) -> Self {
        self.greater_or_equal.push(value.into());
        self
    }

    pub fn less_than(mut self, value: impl Into<FilterValue>) -> Self {
        self.less_than.push(value.into());
        self
    }

    pub fn less_or_equal(mut self, value: impl Into<FilterValue>) -> Self {
        self.less_or_equal.push(value.into());
        self
    }

    /// Replaces the range; always exactly two bounds
    pub fn between(mut self, low: impl Into<FilterValue>, high: impl Into<FilterValue>) -> Self {
        self.between = vec![low.into(), high.into()];
        self
    }

    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FilterValue>,
    {
        self.one_of.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn not_in<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FilterValue>,
    {
        self.not_in.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.slots().iter().all(|s| s.is_empty())
    }

    fn slots(&self) -> [&Vec<FilterValue>; 8] {
        [
            &self.equals,
            &self.greater_than,
            &self.greater_or_equal,
            &self.less_than,
            &self.less_or_equal,
            &self.between,
            &self.one_of,
            &self.not_in,
        ]
    }

    /// Every value replaced by what survives a JSON round trip
    pub fn widened(&self) -> FilterCondition {
        let widen = |slot: &Vec<FilterValue>| slot.iter().map(FilterValue::widened).collect();
        FilterCondition {
            equals: widen(&self.equals),
            greater_than: widen(&self.greater_than),
            greater_or_equal: widen(&self.greater_or_equal),
            less_than: widen(&self.less_than),
            less_or_equal: widen(&self.less_or_equal),
            between: widen(&self.between),
            one_of: widen(&self.one_of),
            not_in: widen(&self.not_in),
        }
    }
}

/// `datasource -> table -> field -> condition`
pub type Filters = BTreeMap<String, BTreeMap<String, BTreeMap<String, FilterCondition>>>;

/// Build a single-field filter map
pub fn single_filter(datasource: &str, table: &str, field: &str, condition: FilterCondition) -> Filters {
    let mut fields = BTreeMap::new();
    fields.insert(field.to_string(), condition);
    let mut tables = BTreeMap::new();
    tables.insert(table.to_string(), fields);
    let mut filters = Filters::new();
    filters.insert(datasource.to_string(), tables);
    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_value_is_empty_object() {
        let json = serde_json::to_string(&FilterCondition::default()).unwrap();
        assert_eq!(json, "{}");
        assert!(FilterCondition::default().is_empty());
    }

    #[test]
    fn test_integer_widens_to_number() {
        let condition = FilterCondition::new().equals(42i64).between(1i64, 10i64);
        let json = serde_json::to_string(&condition).unwrap();
        assert_eq!(json, r#"{"eq":[42],"between":[1,10]}"#);

        let decoded: FilterCondition = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.equals, vec![FilterValue::Number(42.0)]);
        assert_eq!(decoded, condition.widened());
        assert_eq!(decoded.between.len(), 2);
    }

    #[test]
    fn test_mixed_scalars_round_trip() {
        let condition = FilterCondition::new()
            .one_of(["active", "pending"])
            .not_in([true])
            .less_than(2.5);
        let json = serde_json::to_string(&condition).unwrap();
        let decoded: FilterCondition = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, condition);
    }

    #[test]
    fn test_nested_filters_shape() {
        let filters = single_filter("ledger", "account", "status", FilterCondition::new().equals("ACTIVE"));
        let value = serde_json::to_value(&filters).unwrap();
        assert_eq!(value["ledger"]["account"]["status"]["eq"][0], "ACTIVE");
    }
}
