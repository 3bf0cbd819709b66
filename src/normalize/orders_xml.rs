//! Streaming flattener for the XML order report
//! (`GET_XML_ALL_ORDERS_DATA_BY_ORDER_DATE_GENERAL`).
//!
//! The document is read event by event; only the order currently being parsed
//! and at most one batch of finished rows are held in memory. Each `<OrderItem>`
//! becomes one row carrying a copy of its `<Order>`-level fields.

use crate::normalize::{FlatRecord, Scalar};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::io::BufRead;
use thiserror::Error;

pub const BATCH_SIZE: usize = 2000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum XmlError {
    #[error("malformed order XML: {0}")]
    Malformed(String),
    #[error("order XML ended inside <{0}>")]
    Truncated(String),
}

#[derive(Clone, Copy)]
enum Kind {
    Text,
    Int,
}

struct Field {
    path: &'static str,
    column: &'static str,
    kind: Kind,
}

const fn field(path: &'static str, column: &'static str, kind: Kind) -> Field {
    Field { path, column, kind }
}

/// Paths are relative to `<Order>`.
const ORDER_FIELDS: &[Field] = &[
    field("AmazonOrderID", "amazon_order_id", Kind::Text),
    field("MerchantOrderID", "merchant_order_id", Kind::Text),
    field("PurchaseDate", "purchase_date", Kind::Text),
    field("LastUpdatedDate", "last_updated_date", Kind::Text),
    field("OrderStatus", "order_status", Kind::Text),
    field("SalesChannel", "sales_channel", Kind::Text),
    field("FulfillmentData/FulfillmentChannel", "fulfillment_channel", Kind::Text),
    field("FulfillmentData/ShipServiceLevel", "ship_service_level", Kind::Text),
    field("FulfillmentData/Address/City", "ship_city", Kind::Text),
    field("FulfillmentData/Address/State", "ship_state", Kind::Text),
    field("FulfillmentData/Address/PostalCode", "ship_postal_code", Kind::Text),
    field("FulfillmentData/Address/Country", "ship_country", Kind::Text),
    field("IsBusinessOrder", "is_business_order", Kind::Text),
];

/// Paths are relative to `<OrderItem>`.
const ITEM_FIELDS: &[Field] = &[
    field("AmazonOrderItemCode", "order_item_code", Kind::Text),
    field("ASIN", "asin", Kind::Text),
    field("SKU", "sku", Kind::Text),
    field("ItemStatus", "item_status", Kind::Text),
    field("ProductName", "product_name", Kind::Text),
    field("Quantity", "quantity", Kind::Int),
];

/// `<ItemPrice><Component><Type>` values with a dedicated column.
const PRICE_COMPONENTS: &[(&str, &str)] = &[
    ("Principal", "item_price_principal"),
    ("Tax", "item_price_tax"),
    ("Shipping", "item_price_shipping"),
    ("ShippingTax", "item_price_shipping_tax"),
    ("GiftWrap", "item_price_gift_wrap"),
    ("GiftWrapTax", "item_price_gift_wrap_tax"),
];
const PRICE_OTHER: &str = "item_price_other";
const PRICE_CURRENCY: &str = "item_price_currency";
const PROMOTION_IDS: &str = "promotion_ids";
const PROMOTION_DISCOUNT: &str = "promotion_discount";

/// Column order of every row produced by this module.
pub fn columns() -> Vec<&'static str> {
    let mut columns: Vec<&'static str> = ORDER_FIELDS.iter().map(|f| f.column).collect();
    columns.extend(ITEM_FIELDS.iter().map(|f| f.column));
    columns.extend(PRICE_COMPONENTS.iter().map(|(_, c)| *c));
    columns.extend([PRICE_OTHER, PRICE_CURRENCY, PROMOTION_IDS, PROMOTION_DISCOUNT]);
    columns
}

fn default_for(kind: Kind) -> Scalar {
    match kind {
        Kind::Text => Scalar::empty(),
        Kind::Int => Scalar::Int(0),
    }
}

fn parse_as(kind: Kind, raw: &str) -> Scalar {
    let raw = raw.trim();
    match kind {
        Kind::Text => Scalar::Text(raw.to_string()),
        Kind::Int => Scalar::Int(raw.parse().unwrap_or(0)),
    }
}

#[derive(Default)]
struct ItemState {
    values: Vec<(usize, Scalar)>,
    prices: Vec<f64>,
    price_other: f64,
    currency: String,
    promotion_ids: Vec<String>,
    promotion_discount: f64,
}

impl ItemState {
    fn new() -> Self {
        Self {
            prices: vec![0.0; PRICE_COMPONENTS.len()],
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct ComponentState {
    kind: String,
    amount: f64,
}

enum Step {
    Open(String, Option<String>),
    Close(String),
    Both(String, Option<String>),
    Text(String),
    Eof,
    Skip,
}

/// Lazy, single-pass sequence of row batches. Not restartable: each batch is
/// handed out once and its buffer is reused for the next.
pub struct OrderBatches<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    path: Vec<String>,
    text: String,
    order: Vec<Scalar>,
    items: Vec<ItemState>,
    item: Option<ItemState>,
    component: Option<ComponentState>,
    pending: Vec<FlatRecord>,
    batch_size: usize,
    done: bool,
}

impl<R: BufRead> OrderBatches<R> {
    pub fn new(source: R, batch_size: usize) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.config_mut().trim_text(true);
        Self {
            reader,
            buf: Vec::with_capacity(4096),
            path: Vec::new(),
            text: String::new(),
            order: Vec::new(),
            items: Vec::new(),
            item: None,
            component: None,
            pending: Vec::new(),
            batch_size: batch_size.max(1),
            done: false,
        }
    }

    fn advance(&mut self) -> Result<(), XmlError> {
        let step = match self.reader.read_event_into(&mut self.buf) {
            Ok(Event::Start(e)) => Step::Open(tag_name(&e), currency_attr(&e)),
            Ok(Event::Empty(e)) => Step::Both(tag_name(&e), currency_attr(&e)),
            Ok(Event::End(e)) => Step::Close(String::from_utf8_lossy(e.local_name().as_ref()).into_owned()),
            Ok(Event::Text(t)) => Step::Text(
                t.unescape()
                    .map_err(|err| XmlError::Malformed(err.to_string()))?
                    .into_owned(),
            ),
            Ok(Event::CData(c)) => {
                let bytes: &[u8] = &c;
                Step::Text(String::from_utf8_lossy(bytes).into_owned())
            }
            Ok(Event::Eof) => Step::Eof,
            Ok(_) => Step::Skip,
            Err(err) => {
                return Err(XmlError::Malformed(format!(
                    "{err} (near byte {})",
                    self.reader.buffer_position()
                )));
            }
        };
        self.buf.clear();

        match step {
            Step::Open(name, currency) => self.open(name, currency),
            Step::Close(name) => self.close(&name),
            Step::Both(name, currency) => {
                self.open(name.clone(), currency);
                self.close(&name);
            }
            Step::Text(text) => self.text.push_str(&text),
            Step::Eof => {
                if let Some(open) = self.path.last() {
                    return Err(XmlError::Truncated(open.clone()));
                }
                self.done = true;
            }
            Step::Skip => {}
        }
        Ok(())
    }

    fn open(&mut self, name: String, currency: Option<String>) {
        match name.as_str() {
            "Order" => {
                self.order = ORDER_FIELDS.iter().map(|f| default_for(f.kind)).collect();
                self.items.clear();
            }
            "OrderItem" if self.in_order() => self.item = Some(ItemState::new()),
            "Component" if self.item.is_some() => self.component = Some(ComponentState::default()),
            "Amount" => {
                if let (Some(item), Some(currency)) = (self.item.as_mut(), currency)
                    && item.currency.is_empty()
                {
                    item.currency = currency;
                }
            }
            _ => {}
        }
        self.path.push(name);
        self.text.clear();
    }

    fn close(&mut self, name: &str) {
        let text = std::mem::take(&mut self.text);
        if !text.is_empty() {
            self.assign(&text);
        }
        match name {
            "Component" => {
                if let (Some(item), Some(component)) = (self.item.as_mut(), self.component.take()) {
                    match PRICE_COMPONENTS.iter().position(|(kind, _)| *kind == component.kind) {
                        Some(index) => item.prices[index] += component.amount,
                        None => item.price_other += component.amount,
                    }
                }
            }
            "OrderItem" => {
                if let Some(item) = self.item.take() {
                    self.items.push(item);
                }
            }
            "Order" => {
                for item in std::mem::take(&mut self.items) {
                    let record = self.to_record(item);
                    self.pending.push(record);
                }
            }
            _ => {}
        }
        self.path.pop();
    }

    fn in_order(&self) -> bool {
        self.path.iter().any(|p| p == "Order")
    }

    fn assign(&mut self, text: &str) {
        if let Some(item) = self.item.as_mut() {
            let Some(rel) = relative(&self.path, "OrderItem") else {
                return;
            };
            if let Some(index) = ITEM_FIELDS.iter().position(|f| f.path == rel) {
                item.values.push((index, parse_as(ITEM_FIELDS[index].kind, text)));
                return;
            }
            match rel.as_str() {
                "ItemPrice/Component/Type" => {
                    if let Some(component) = self.component.as_mut() {
                        component.kind = text.trim().to_string();
                    }
                }
                "ItemPrice/Component/Amount" => {
                    if let Some(component) = self.component.as_mut() {
                        component.amount = text.trim().parse().unwrap_or(0.0);
                    }
                }
                "Promotion/PromotionIDs" => item.promotion_ids.push(text.trim().to_string()),
                "Promotion/ItemPromotionDiscount" | "Promotion/ShipPromotionDiscount" => {
                    item.promotion_discount += text.trim().parse::<f64>().unwrap_or(0.0);
                }
                _ => {}
            }
            return;
        }
        if let Some(rel) = relative(&self.path, "Order")
            && let Some(index) = ORDER_FIELDS.iter().position(|f| f.path == rel)
            && let Some(slot) = self.order.get_mut(index)
        {
            *slot = parse_as(ORDER_FIELDS[index].kind, text);
        }
    }

    fn to_record(&self, item: ItemState) -> FlatRecord {
        let mut record = FlatRecord::new();
        for (index, f) in ORDER_FIELDS.iter().enumerate() {
            let value = self
                .order
                .get(index)
                .cloned()
                .unwrap_or_else(|| default_for(f.kind));
            record.insert(f.column, value);
        }
        let mut item_values: Vec<Scalar> = ITEM_FIELDS.iter().map(|f| default_for(f.kind)).collect();
        for (index, value) in item.values {
            item_values[index] = value;
        }
        for (f, value) in ITEM_FIELDS.iter().zip(item_values) {
            record.insert(f.column, value);
        }
        for ((_, column), amount) in PRICE_COMPONENTS.iter().zip(&item.prices) {
            record.insert(*column, Scalar::Float(round_cents(*amount)));
        }
        record.insert(PRICE_OTHER, Scalar::Float(round_cents(item.price_other)));
        record.insert(PRICE_CURRENCY, item.currency);
        record.insert(PROMOTION_IDS, item.promotion_ids.join(";"));
        record.insert(PROMOTION_DISCOUNT, Scalar::Float(round_cents(item.promotion_discount)));
        record
    }
}

/// Leaf path below the innermost `anchor` element, joined with `/`.
fn relative(path: &[String], anchor: &str) -> Option<String> {
    let start = path.iter().rposition(|p| p == anchor)?;
    Some(path[start + 1..].join("/"))
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn tag_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn currency_attr(e: &BytesStart<'_>) -> Option<String> {
    e.try_get_attribute("currency")
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

impl<R: BufRead> Iterator for OrderBatches<R> {
    type Item = Result<Vec<FlatRecord>, XmlError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.pending.len() >= self.batch_size {
                return Some(Ok(self.pending.drain(..self.batch_size).collect()));
            }
            if self.done {
                if self.pending.is_empty() {
                    return None;
                }
                return Some(Ok(std::mem::take(&mut self.pending)));
            }
            if let Err(err) = self.advance() {
                self.done = true;
                self.pending.clear();
                return Some(Err(err));
            }
        }
    }
}

/// Whole-document flattening, for callers that do not need bounded memory.
pub fn flatten_orders(xml: &[u8]) -> Result<Vec<FlatRecord>, XmlError> {
    let mut rows = Vec::new();
    for batch in OrderBatches::new(xml, usize::MAX) {
        rows.extend(batch?);
    }
    Ok(rows)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::fmt::Write;

    pub fn order_xml(orders: usize, items_per_order: usize) -> String {
        let mut xml = String::from("<?xml version=\"1.0\"?>\n<AmazonEnvelope><Header><DocumentVersion>1.01</DocumentVersion></Header>");
        for o in 0..orders {
            write!(
                xml,
                "<Message><Order><AmazonOrderID>302-{o:07}</AmazonOrderID>\
                 <PurchaseDate>2024-05-01T10:00:00+00:00</PurchaseDate>\
                 <OrderStatus>Shipped</OrderStatus>\
                 <FulfillmentData><FulfillmentChannel>Amazon</FulfillmentChannel>\
                 <Address><City>Berlin</City><Country>DE</Country></Address></FulfillmentData>"
            )
            .unwrap();
            for i in 0..items_per_order {
                write!(
                    xml,
                    "<OrderItem><AmazonOrderItemCode>{o}-{i}</AmazonOrderItemCode>\
                     <ASIN>B0{i:08}</ASIN><SKU>SKU-{i}</SKU><Quantity>{q}</Quantity>\
                     <ItemPrice><Component><Type>Principal</Type><Amount currency=\"EUR\">19.99</Amount></Component>\
                     <Component><Type>Tax</Type><Amount currency=\"EUR\">3.80</Amount></Component></ItemPrice>\
                     </OrderItem>",
                    q = i + 1
                )
                .unwrap();
            }
            xml.push_str("</Order></Message>");
        }
        xml.push_str("</AmazonEnvelope>");
        xml
    }

    #[test]
    fn batches_are_bounded_and_match_whole_document() {
        let xml = order_xml(1500, 3);
        let sizes: Vec<usize> = OrderBatches::new(xml.as_bytes(), BATCH_SIZE)
            .map(|batch| batch.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![2000, 2000, 500]);

        let streamed: Vec<FlatRecord> = OrderBatches::new(xml.as_bytes(), BATCH_SIZE)
            .flat_map(|batch| batch.unwrap())
            .collect();
        assert_eq!(streamed.len(), 1500 * 3);
        // Row 2000 straddles the first batch boundary: order 666, item 2.
        assert_eq!(streamed[2000].text("amazon_order_id"), "302-0000666");
        assert_eq!(streamed[2000].text("order_item_code"), "666-2");
        assert_eq!(streamed[2000].get("quantity"), Some(&Scalar::Int(3)));
        assert_eq!(streamed[4499].text("amazon_order_id"), "302-0001499");
        assert_eq!(streamed[4499].text("sku"), "SKU-2");
        assert_eq!(streamed[4499].text("ship_city"), "Berlin");
        assert_eq!(streamed, flatten_orders(xml.as_bytes()).unwrap());
    }

    #[test]
    fn each_item_repeats_order_fields() {
        let rows = flatten_orders(order_xml(2, 2).as_bytes()).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].text("amazon_order_id"), "302-0000000");
        assert_eq!(rows[1].text("amazon_order_id"), "302-0000000");
        assert_eq!(rows[2].text("amazon_order_id"), "302-0000001");
        assert_eq!(rows[1].text("sku"), "SKU-1");
        assert_eq!(rows[1].get("quantity"), Some(&Scalar::Int(2)));
        assert_eq!(rows[0].text("ship_city"), "Berlin");
        assert_eq!(rows[0].get("item_price_principal"), Some(&Scalar::Float(19.99)));
        assert_eq!(rows[0].get("item_price_tax"), Some(&Scalar::Float(3.8)));
        assert_eq!(rows[0].text("item_price_currency"), "EUR");
        let expected: Vec<&str> = columns();
        for row in &rows {
            assert_eq!(row.columns().collect::<Vec<_>>(), expected);
        }
    }

    #[test]
    fn missing_nodes_fall_back_to_defaults() {
        let xml = "<AmazonEnvelope><Message><Order><AmazonOrderID>1</AmazonOrderID>\
                   <OrderItem><SKU>A &amp; B</SKU><Quantity>n/a</Quantity>\
                   <Promotion><PromotionIDs>P1</PromotionIDs><ItemPromotionDiscount>-2.5</ItemPromotionDiscount></Promotion>\
                   <Promotion><PromotionIDs>P2</PromotionIDs><ShipPromotionDiscount>-1</ShipPromotionDiscount></Promotion>\
                   <ItemPrice><Component><Type>Surcharge</Type><Amount>1.25</Amount></Component></ItemPrice>\
                   </OrderItem><OrderItem/></Order></Message></AmazonEnvelope>";
        let rows = flatten_orders(xml.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].text("sku"), "A & B");
        assert_eq!(rows[0].get("quantity"), Some(&Scalar::Int(0)));
        assert_eq!(rows[0].text("asin"), "");
        assert_eq!(rows[0].text("purchase_date"), "");
        assert_eq!(rows[0].get("item_price_principal"), Some(&Scalar::Float(0.0)));
        assert_eq!(rows[0].get("item_price_other"), Some(&Scalar::Float(1.25)));
        assert_eq!(rows[0].text("promotion_ids"), "P1;P2");
        assert_eq!(rows[0].get("promotion_discount"), Some(&Scalar::Float(-3.5)));
        assert_eq!(rows[1].text("amazon_order_id"), "1");
        assert_eq!(rows[1].text("sku"), "");
    }

    #[test]
    fn malformed_xml_stops_after_emitted_batches() {
        let mut xml = order_xml(1000, 3);
        xml.truncate(xml.len() - "</AmazonEnvelope>".len());
        xml.push_str("<Message><Order><AmazonOrderID>x</Wrong></Order></Message></AmazonEnvelope>");
        let mut batches = OrderBatches::new(xml.as_bytes(), BATCH_SIZE);
        assert_eq!(batches.next().map(|b| b.unwrap().len()), Some(2000));
        assert!(matches!(batches.next(), Some(Err(XmlError::Malformed(_)))));
        assert!(batches.next().is_none());
    }

    #[test]
    fn truncated_document_is_an_error() {
        let xml = "<AmazonEnvelope><Message><Order><AmazonOrderID>1</AmazonOrderID>";
        let err = flatten_orders(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, XmlError::Truncated(_) | XmlError::Malformed(_)));
    }
}
