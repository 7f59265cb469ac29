//! Fiscal receipt sent along with a YooKassa payment.

use serde::Serialize;

use crate::domain::{Basket, Money, Quote};

pub const VAT_CODE: u8 = 2;
pub const TAX_SYSTEM_CODE: u8 = 1;
pub const CURRENCY: &str = "RUB";
const DESCRIPTION_LIMIT: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Amount { pub value: String, pub currency: &'static str }

impl Amount {
    pub fn rub(money: Money) -> Self { Self { value: money.to_fixed(), currency: CURRENCY } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentSubject { Commodity, Service }

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiptItem {
    pub description: String,
    pub quantity: u32,
    pub amount: Amount,
    pub vat_code: u8,
    pub payment_mode: &'static str,
    pub payment_subject: PaymentSubject,
    #[serde(skip)]
    pub unit_price: Money,
}

impl ReceiptItem {
    fn new(description: &str, quantity: u32, unit_price: Money, subject: PaymentSubject) -> Self {
        Self {
            description: description.chars().take(DESCRIPTION_LIMIT).collect(),
            quantity,
            amount: Amount::rub(unit_price),
            vat_code: VAT_CODE,
            payment_mode: "full_prepayment",
            payment_subject: subject,
            unit_price,
        }
    }

    pub fn total(&self) -> Money { self.unit_price.multiply(self.quantity) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReceiptCustomer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Receipt {
    pub customer: ReceiptCustomer,
    pub items: Vec<ReceiptItem>,
    pub tax_system_code: u8,
}

impl Receipt {
    /// Itemized receipt whose lines sum exactly to `quote.total`.
    ///
    /// Lines carry the discounted unit price. The kopecks lost to per-unit
    /// rounding are put on one unit of the last line, split off into its
    /// own line when that line has more than one unit. Delivery is a
    /// separate service line.
    pub fn build(basket: &Basket, quote: &Quote, customer: ReceiptCustomer) -> Self {
        let mut items: Vec<ReceiptItem> = basket
            .lines()
            .iter()
            .map(|l| {
                let description = format!("{} {}", l.product_name, l.feature_name);
                ReceiptItem::new(description.trim(), l.quantity.value(), l.unit_price.discounted(quote.discount_pct), PaymentSubject::Commodity)
            })
            .collect();

        let lines_total: Money = items.iter().map(ReceiptItem::total).sum();
        let residual = quote.items_total - lines_total;
        if residual != Money::ZERO {
            if let Some(last) = items.pop() {
                let adjusted = last.unit_price + residual;
                if last.quantity > 1 {
                    let rest = ReceiptItem::new(&last.description, last.quantity - 1, last.unit_price, PaymentSubject::Commodity);
                    items.push(rest);
                }
                items.push(ReceiptItem::new(&last.description, 1, adjusted, PaymentSubject::Commodity));
            }
        }

        if quote.delivery > Money::ZERO {
            items.push(ReceiptItem::new("Доставка", 1, quote.delivery, PaymentSubject::Service));
        }

        Self { customer, items, tax_system_code: TAX_SYSTEM_CODE }
    }

    pub fn total(&self) -> Money { self.items.iter().map(ReceiptItem::total).sum() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::product::fixtures;
    use crate::domain::{Percent, PricedLine, ProductWithFeatures, Quantity};
    use rust_decimal_macros::dec;

    fn basket(lines: &[(rust_decimal::Decimal, u32)]) -> Basket {
        let mut basket = Basket::new();
        for (i, (price, qty)) in lines.iter().enumerate() {
            let pid = format!("P{}", i);
            let product = ProductWithFeatures { product: fixtures::product(&pid), features: vec![fixtures::feature(&pid, "F", *price, 10)] };
            basket.add_item(PricedLine::from_catalog(&product, &product.features[0], Quantity::new(*qty).unwrap()));
        }
        basket
    }

    #[test]
    fn test_receipt_matches_total_with_delivery() {
        let b = basket(&[(dec!(1000), 1)]);
        let quote = b.quote(Some(Percent::new(dec!(10)).unwrap()), Money::new(dec!(295)));
        let receipt = Receipt::build(&b, &quote, ReceiptCustomer::default());
        assert_eq!(receipt.items.len(), 2);
        assert_eq!(receipt.items[0].amount.value, "900.00");
        assert_eq!(receipt.items[1].payment_subject, PaymentSubject::Service);
        assert_eq!(receipt.total(), Money::new(dec!(1195)));
        assert_eq!(receipt.tax_system_code, 1);
    }

    #[test]
    fn test_rounding_residual_goes_to_one_unit() {
        // Per-unit lines sum to 674.61, the discounted subtotal is 674.64.
        let b = basket(&[(dec!(333.33), 3), (dec!(0.99), 7)]);
        let quote = b.quote(Some(Percent::new(dec!(33)).unwrap()), Money::ZERO);
        let receipt = Receipt::build(&b, &quote, ReceiptCustomer::default());
        assert_eq!(receipt.total(), quote.items_total);
        let last = receipt.items.last().unwrap();
        assert_eq!(last.quantity, 1);
        assert_eq!(last.unit_price, Money::new(dec!(0.69)));
        let qty: u32 = receipt.items.iter().map(|i| i.quantity).sum();
        assert_eq!(qty, 10);
    }

    #[test]
    fn test_serialized_shape() {
        let b = basket(&[(dec!(500), 2)]);
        let quote = b.quote(None, Money::ZERO);
        let receipt = Receipt::build(&b, &quote, ReceiptCustomer { email: Some("a@b.ru".into()), ..Default::default() });
        let json = serde_json::to_value(&receipt).unwrap();
        assert_eq!(json["items"][0]["payment_mode"], "full_prepayment");
        assert_eq!(json["items"][0]["vat_code"], 2);
        assert_eq!(json["items"][0]["payment_subject"], "commodity");
        assert_eq!(json["items"][0]["amount"]["currency"], "RUB");
        assert_eq!(json["customer"]["email"], "a@b.ru");
        assert!(json["customer"].get("phone").is_none());
    }
}
