pub mod delimited;
pub mod finance;
pub mod json_rows;
pub mod orders_xml;

use indexmap::{IndexMap, IndexSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Text(String),
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn empty() -> Self {
        Scalar::Text(String::new())
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Text(s) => f.write_str(s),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

/// One denormalized output row; column order is insertion order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FlatRecord(IndexMap<String, Scalar>);

impl FlatRecord {
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Scalar>) {
        self.0.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Scalar> {
        self.0.get(column)
    }

    /// Display value of a column, `""` when absent.
    pub fn text(&self, column: &str) -> String {
        self.0.get(column).map(ToString::to_string).unwrap_or_default()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Scalar>> FromIterator<(K, V)> for FlatRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = FlatRecord::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

/// `FBAPerUnitFulfillmentFee` → `fba_per_unit_fulfillment_fee`,
/// `Amazon RMA ID` → `amazon_rma_id`, `afn-total-quantity` → `afn_total_quantity`.
pub fn normalize_column_name(raw: &str) -> String {
    let chars: Vec<char> = raw.trim().chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && i > 0 {
                let prev = chars[i - 1];
                let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
                if prev.is_ascii_lowercase()
                    || prev.is_ascii_digit()
                    || (prev.is_ascii_uppercase() && next_lower)
                {
                    out.push('_');
                }
            }
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let collapsed: Vec<&str> = out.split('_').filter(|s| !s.is_empty()).collect();
    collapsed.join("_")
}

/// Pads every record to the union of all columns, first-seen order, `""` default.
pub fn conform_columns(records: Vec<FlatRecord>) -> Vec<FlatRecord> {
    let mut columns: IndexSet<String> = IndexSet::new();
    for record in &records {
        for column in record.columns() {
            if !columns.contains(column) {
                columns.insert(column.to_string());
            }
        }
    }
    records
        .into_iter()
        .map(|mut record| {
            columns
                .iter()
                .map(|c| {
                    let value = record.0.swap_remove(c).unwrap_or_else(Scalar::empty);
                    (c.clone(), value)
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_names_normalize_to_snake_case() {
        let cases = [
            ("FBAPerUnitFulfillmentFee", "fba_per_unit_fulfillment_fee"),
            ("MarketplaceFacilitatorTax-Principal", "marketplace_facilitator_tax_principal"),
            ("GiftWrapTax", "gift_wrap_tax"),
            ("ShippingHB", "shipping_hb"),
            ("CODItemCharge", "cod_item_charge"),
            ("Amazon RMA ID", "amazon_rma_id"),
            ("afn-total-quantity", "afn_total_quantity"),
            ("campaignId", "campaign_id"),
            ("sales7d", "sales7d"),
            ("  Order  ID ", "order_id"),
        ];
        for (raw, expected) in cases {
            assert_eq!(normalize_column_name(raw), expected, "{raw}");
        }
    }

    #[test]
    fn conform_pads_missing_columns_in_first_seen_order() {
        let a: FlatRecord = [("x", "1"), ("y", "2")].into_iter().collect();
        let b: FlatRecord = [("z", "3"), ("x", "4")].into_iter().collect();
        let out = conform_columns(vec![a, b]);
        let cols: Vec<Vec<&str>> = out.iter().map(|r| r.columns().collect()).collect();
        assert_eq!(cols[0], vec!["x", "y", "z"]);
        assert_eq!(cols[1], vec!["x", "y", "z"]);
        assert_eq!(out[1].text("y"), "");
        assert_eq!(out[1].text("x"), "4");
    }

    #[test]
    fn scalar_display() {
        assert_eq!(Scalar::Int(3).to_string(), "3");
        assert_eq!(Scalar::Float(12.5).to_string(), "12.5");
        assert_eq!(Scalar::empty().to_string(), "");
    }
}
