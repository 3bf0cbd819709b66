//! Financial events (`listFinancialEvents` pages) to flat rows.
//!
//! Charge, fee and withheld-tax types map onto a fixed registry of
//! `<type>_amount` / `<type>_currency` columns. Types outside the registry are
//! summed into the `other_*` bucket so that every page yields the same columns.

use crate::normalize::{FlatRecord, Scalar, normalize_column_name};
use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FinanceError {
    #[error("financial events page is not an object")]
    NotAnObject,
    #[error("{list} is not an array")]
    NotAList { list: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Id,
    Amount,
    Currency,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Charge,
    Fee,
    Withheld,
}

const CHARGE_TYPES: &[&str] = &[
    "Principal",
    "Tax",
    "GiftWrap",
    "GiftWrapTax",
    "ShippingCharge",
    "ShippingTax",
    "ShippingHB",
    "Goodwill",
    "RestockingFee",
    "ReturnShipping",
    "ExportCharge",
    "COD",
    "CODTax",
    "CODItemCharge",
    "CODItemTaxCharge",
    "CODOrderCharge",
    "CODOrderTaxCharge",
    "CODShippingCharge",
    "CODShippingTaxCharge",
    "MarketplaceFacilitatorTax-Principal",
    "MarketplaceFacilitatorTax-Shipping",
    "MarketplaceFacilitatorTax-Giftwrap",
    "MarketplaceFacilitatorTax-Other",
    "LowValueGoodsTax-Principal",
    "LowValueGoodsTax-Shipping",
];

const FEE_TYPES: &[&str] = &[
    "Commission",
    "RefundCommission",
    "FBAPerUnitFulfillmentFee",
    "FBAPerOrderFulfillmentFee",
    "FBAWeightBasedFee",
    "FixedClosingFee",
    "VariableClosingFee",
    "GiftwrapChargeback",
    "ShippingChargeback",
    "SalesTaxCollectionFee",
    "DigitalServicesFee",
    "DigitalServicesFeeFBA",
    "TechnologyFee",
];

const WITHHELD_TYPES: &[&str] = &[
    "MarketplaceFacilitatorTax-Principal",
    "MarketplaceFacilitatorTax-Shipping",
    "MarketplaceFacilitatorTax-Giftwrap",
    "MarketplaceFacilitatorTax-Other",
    "LowValueGoodsTax-Principal",
    "LowValueGoodsTax-Shipping",
];

/// (event list, event_type, line-item list)
const EVENT_LISTS: &[(&str, &str, &str)] = &[
    ("ShipmentEventList", "shipment", "ShipmentItemList"),
    ("RefundEventList", "refund", "ShipmentItemAdjustmentList"),
    ("ChargebackEventList", "chargeback", "ShipmentItemAdjustmentList"),
    ("GuaranteeClaimEventList", "guarantee_claim", "ShipmentItemAdjustmentList"),
];

const ID_COLUMNS: &[&str] = &[
    "event_type",
    "amazon_order_id",
    "seller_order_id",
    "marketplace_name",
    "posted_date",
    "seller_sku",
    "order_item_id",
    "order_adjustment_item_id",
    "quantity",
];

const OTHER_AMOUNT: &str = "other_amount";
const OTHER_CURRENCY: &str = "other_currency";
const OTHER_TYPES: &str = "other_types";
const PROMOTION_AMOUNT: &str = "promotion_amount";
const PROMOTION_IDS: &str = "promotion_ids";

fn registered(category: Category, kind: &str) -> Option<String> {
    let (list, prefix) = match category {
        Category::Charge => (CHARGE_TYPES, ""),
        Category::Fee => (FEE_TYPES, ""),
        Category::Withheld => (WITHHELD_TYPES, "withheld_"),
    };
    list.contains(&kind)
        .then(|| format!("{prefix}{}", normalize_column_name(kind)))
}

/// Column name to role, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicSchema {
    columns: IndexMap<String, ColumnRole>,
}

impl DynamicSchema {
    fn registry() -> Self {
        let mut columns = IndexMap::new();
        for id in ID_COLUMNS {
            columns.insert((*id).to_string(), ColumnRole::Id);
        }
        let registry = CHARGE_TYPES
            .iter()
            .filter_map(|t| registered(Category::Charge, t))
            .chain(FEE_TYPES.iter().filter_map(|t| registered(Category::Fee, t)))
            .chain(WITHHELD_TYPES.iter().filter_map(|t| registered(Category::Withheld, t)));
        for stem in registry {
            columns.insert(format!("{stem}_amount"), ColumnRole::Amount);
            columns.insert(format!("{stem}_currency"), ColumnRole::Currency);
        }
        columns.insert(OTHER_AMOUNT.to_string(), ColumnRole::Amount);
        columns.insert(OTHER_CURRENCY.to_string(), ColumnRole::Currency);
        columns.insert(OTHER_TYPES.to_string(), ColumnRole::Text);
        columns.insert(PROMOTION_AMOUNT.to_string(), ColumnRole::Amount);
        columns.insert(PROMOTION_IDS.to_string(), ColumnRole::Text);
        Self { columns }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    #[allow(dead_code)]
    pub fn role(&self, column: &str) -> Option<ColumnRole> {
        self.columns.get(column).copied()
    }

    fn blank_row(&self) -> FlatRecord {
        self.columns
            .iter()
            .map(|(column, role)| {
                let value = match role {
                    ColumnRole::Id if column == "quantity" => Scalar::Int(0),
                    _ => Scalar::empty(),
                };
                (column.clone(), value)
            })
            .collect()
    }
}

/// Pass-one result: which registered types occur and which do not fit the registry.
#[derive(Debug, Default)]
pub struct PageScan {
    pub known: IndexSet<String>,
    pub unknown: IndexSet<String>,
    pub line_items: usize,
}

struct LineItem<'a> {
    event_type: &'static str,
    event: &'a Value,
    item: &'a Value,
}

struct Money {
    category: Category,
    kind: String,
    amount: Option<f64>,
    currency: String,
}

fn line_items(page: &Value) -> Result<Vec<LineItem<'_>>, FinanceError> {
    let Some(lists) = page.as_object() else {
        return Err(FinanceError::NotAnObject);
    };
    for list_name in lists.keys() {
        if !EVENT_LISTS.iter().any(|(name, _, _)| *name == list_name.as_str()) {
            debug!(target = "extractor.finance", list = %list_name, "event list not extracted");
        }
    }
    let mut out = Vec::new();
    for &(list_name, event_type, item_list) in EVENT_LISTS {
        let events = match lists.get(list_name) {
            None | Some(Value::Null) => continue,
            Some(Value::Array(events)) => events,
            Some(_) => {
                return Err(FinanceError::NotAList {
                    list: list_name.to_string(),
                });
            }
        };
        for event in events {
            let Some(items) = event.get(item_list).and_then(Value::as_array) else {
                continue;
            };
            out.extend(items.iter().map(|item| LineItem {
                event_type,
                event,
                item,
            }));
        }
    }
    Ok(out)
}

fn money_entries(item: &Value) -> Vec<Money> {
    let mut out = Vec::new();
    let mut collect = |category: Category, list: &Value, type_key: &str, amount_key: &str| {
        for entry in list.as_array().into_iter().flatten() {
            let kind = entry.get(type_key).and_then(Value::as_str).unwrap_or_default();
            if kind.is_empty() {
                continue;
            }
            let (amount, currency) = read_amount(entry.get(amount_key));
            out.push(Money {
                category,
                kind: kind.to_string(),
                amount,
                currency,
            });
        }
    };
    for key in ["ItemChargeList", "ItemChargeAdjustmentList"] {
        if let Some(list) = item.get(key) {
            collect(Category::Charge, list, "ChargeType", "ChargeAmount");
        }
    }
    for key in ["ItemFeeList", "ItemFeeAdjustmentList"] {
        if let Some(list) = item.get(key) {
            collect(Category::Fee, list, "FeeType", "FeeAmount");
        }
    }
    if let Some(groups) = item.get("ItemTaxWithheldList").and_then(Value::as_array) {
        for group in groups {
            if let Some(list) = group.get("TaxesWithheld") {
                collect(Category::Withheld, list, "ChargeType", "ChargeAmount");
            }
        }
    }
    out
}

fn read_amount(value: Option<&Value>) -> (Option<f64>, String) {
    let Some(value) = value else {
        return (None, String::new());
    };
    let amount = match value.get("CurrencyAmount") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    let currency = value
        .get("CurrencyCode")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    (amount, currency)
}

fn text_of(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn add_amount(record: &mut FlatRecord, column: &str, amount: Option<f64>) {
    let Some(amount) = amount else {
        return;
    };
    let total = match record.get(column) {
        Some(Scalar::Float(existing)) => existing + amount,
        _ => amount,
    };
    record.insert(column, Scalar::Float((total * 100.0).round() / 100.0));
}

fn set_if_blank(record: &mut FlatRecord, column: &str, value: &str) {
    if !value.is_empty() && record.text(column).is_empty() {
        record.insert(column, value);
    }
}

/// Pass one: discovers the money types of a page without emitting rows.
pub fn scan_page(page: &Value) -> Result<PageScan, FinanceError> {
    let mut scan = PageScan::default();
    for line in line_items(page)? {
        scan.line_items += 1;
        for money in money_entries(line.item) {
            match registered(money.category, &money.kind) {
                Some(stem) => {
                    scan.known.insert(stem);
                }
                None => {
                    scan.unknown.insert(money.kind);
                }
            }
        }
    }
    Ok(scan)
}

/// Both passes over one page. Every row carries exactly the columns of
/// [`DynamicSchema`], whatever types the page contains.
pub fn normalize_page(page: &Value) -> Result<(DynamicSchema, Vec<FlatRecord>), FinanceError> {
    let scan = scan_page(page)?;
    if !scan.unknown.is_empty() {
        warn!(
            target = "extractor.finance",
            types = ?scan.unknown,
            "unregistered financial event types folded into other_amount"
        );
    }
    let schema = DynamicSchema::registry();
    debug!(
        target = "extractor.finance",
        line_items = scan.line_items,
        known_types = scan.known.len(),
        "financial events page scanned"
    );

    let mut rows = Vec::with_capacity(scan.line_items);
    for line in line_items(page)? {
        let mut record = schema.blank_row();
        record.insert("event_type", line.event_type);
        record.insert("amazon_order_id", text_of(line.event, "AmazonOrderId"));
        record.insert("seller_order_id", text_of(line.event, "SellerOrderId"));
        record.insert("marketplace_name", text_of(line.event, "MarketplaceName"));
        record.insert("posted_date", text_of(line.event, "PostedDate"));
        record.insert("seller_sku", text_of(line.item, "SellerSKU"));
        record.insert("order_item_id", text_of(line.item, "OrderItemId"));
        record.insert(
            "order_adjustment_item_id",
            text_of(line.item, "OrderAdjustmentItemId"),
        );
        let quantity = line
            .item
            .get("QuantityShipped")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        record.insert("quantity", Scalar::Int(quantity));

        let mut other_types: IndexSet<String> = IndexSet::new();
        for money in money_entries(line.item) {
            match registered(money.category, &money.kind) {
                Some(stem) => {
                    add_amount(&mut record, &format!("{stem}_amount"), money.amount);
                    set_if_blank(&mut record, &format!("{stem}_currency"), &money.currency);
                }
                None => {
                    add_amount(&mut record, OTHER_AMOUNT, money.amount);
                    set_if_blank(&mut record, OTHER_CURRENCY, &money.currency);
                    other_types.insert(money.kind);
                }
            }
        }
        if !other_types.is_empty() {
            let joined: Vec<&str> = other_types.iter().map(String::as_str).collect();
            record.insert(OTHER_TYPES, joined.join(";"));
        }

        let mut promotion_ids = Vec::new();
        for key in ["PromotionList", "PromotionAdjustmentList"] {
            for promotion in line.item.get(key).and_then(Value::as_array).into_iter().flatten() {
                let (amount, _) = read_amount(promotion.get("PromotionAmount"));
                add_amount(&mut record, PROMOTION_AMOUNT, amount);
                let id = text_of(promotion, "PromotionId");
                if !id.is_empty() {
                    promotion_ids.push(id);
                }
            }
        }
        if !promotion_ids.is_empty() {
            record.insert(PROMOTION_IDS, promotion_ids.join(";"));
        }
        rows.push(record);
    }
    Ok((schema, rows))
}
