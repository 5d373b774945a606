use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;

use common_money::Money;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A cart line as read from the cart store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub product_id: Option<String>,
    #[serde(default)]
    pub variant_id: Option<String>,
    pub quantity: u32,
    pub unit_price: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PaymentMethod {
    CashOnDelivery,
    /// Online payment through the named provider.
    Online(String),
}

impl PaymentMethod {
    pub fn is_offline(&self) -> bool {
        matches!(self, PaymentMethod::CashOnDelivery)
    }

    pub fn code(&self) -> &str {
        match self {
            PaymentMethod::CashOnDelivery => "cod",
            PaymentMethod::Online(provider) => provider,
        }
    }
}

impl From<String> for PaymentMethod {
    fn from(value: String) -> Self {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "cod" | "cash_on_delivery" | "cash" => PaymentMethod::CashOnDelivery,
            _ => PaymentMethod::Online(normalized),
        }
    }
}

impl From<PaymentMethod> for String {
    fn from(value: PaymentMethod) -> Self {
        value.code().to_string()
    }
}

impl Serialize for PaymentMethod {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for PaymentMethod {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(PaymentMethod::from)
    }
}

/// Shipping and contact form values as typed by the shopper.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutForm {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub payment_method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftLine {
    pub product_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    pub quantity: u32,
    pub unit_price: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddress {
    pub line: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub full_name: String,
    /// Digits only, leading `+` preserved.
    pub phone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A validated order-creation request. Submitted once; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDraft {
    pub submission_id: Uuid,
    pub line_items: Vec<DraftLine>,
    pub shipping_address: ShippingAddress,
    pub contact: Contact,
    pub payment_method: PaymentMethod,
    /// Client-side sum for display only; the order service computes the real total.
    pub client_subtotal: Money,
}

/// Field-keyed validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("order draft rejected: {}", summary(.fields))]
pub struct DraftErrors {
    pub fields: BTreeMap<String, String>,
}

fn summary(fields: &BTreeMap<String, String>) -> String {
    fields.keys().cloned().collect::<Vec<_>>().join(", ")
}

impl DraftErrors {
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct DraftRules {
    pub min_address_len: usize,
    pub phone_digits: RangeInclusive<usize>,
}

impl Default for DraftRules {
    fn default() -> Self {
        Self {
            min_address_len: 10,
            phone_digits: 10..=11,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderDraftBuilder {
    rules: DraftRules,
}

impl OrderDraftBuilder {
    pub fn new(rules: DraftRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &DraftRules {
        &self.rules
    }

    /// Validate cart + form and produce a fresh draft with a new submission id.
    pub fn build(&self, lines: &[CartLine], form: &CheckoutForm) -> Result<OrderDraft, DraftErrors> {
        let mut errors = FieldErrors::default();

        if lines.is_empty() {
            errors.add("cart", "cart is empty");
        }
        let mut line_items = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            let product_id = line
                .product_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty());
            let Some(product_id) = product_id else {
                errors.add(format!("lineItems[{idx}].productId"), "product could not be resolved");
                continue;
            };
            if line.quantity == 0 {
                errors.add(format!("lineItems[{idx}].quantity"), "quantity must be at least 1");
            }
            if line.unit_price.is_negative() {
                errors.add(format!("lineItems[{idx}].unitPrice"), "unit price cannot be negative");
            }
            line_items.push(DraftLine {
                product_id: product_id.to_string(),
                variant_id: non_empty(line.variant_id.as_deref()),
                quantity: line.quantity,
                unit_price: line.unit_price.clone(),
            });
        }

        let full_name = collapse_whitespace(&form.full_name);
        if full_name.is_empty() {
            errors.add("fullName", "full name is required");
        }

        let phone = normalize_phone(&form.phone);
        match &phone {
            None if form.phone.trim().is_empty() => errors.add("phone", "phone is required"),
            None => errors.add("phone", "phone may only contain digits, spaces, dashes and a leading +"),
            Some(p) => {
                let digits = p.trim_start_matches('+').len();
                if !self.rules.phone_digits.contains(&digits) {
                    errors.add(
                        "phone",
                        format!(
                            "phone must contain {} to {} digits",
                            self.rules.phone_digits.start(),
                            self.rules.phone_digits.end()
                        ),
                    );
                }
            }
        }

        let email = non_empty(form.email.as_deref());
        if let Some(email) = &email {
            if !looks_like_email(email) {
                errors.add("email", "email address is not valid");
            }
        }

        let address = collapse_whitespace(&form.address);
        if address.is_empty() {
            errors.add("address", "address is required");
        } else if address.chars().count() < self.rules.min_address_len {
            errors.add(
                "address",
                format!("address must be at least {} characters", self.rules.min_address_len),
            );
        }

        let payment_method = PaymentMethod::from(form.payment_method.clone());
        if payment_method.code().is_empty() {
            errors.add("paymentMethod", "choose a payment method");
        }

        errors.into_result()?;

        let client_subtotal = line_items
            .iter()
            .map(|l| l.unit_price.times(l.quantity))
            .sum();
        Ok(OrderDraft {
            submission_id: Uuid::new_v4(),
            line_items,
            shipping_address: ShippingAddress {
                line: address,
                city: non_empty(form.city.as_deref()),
                note: non_empty(form.note.as_deref()),
            },
            contact: Contact {
                full_name,
                phone: phone.unwrap_or_default(),
                email,
            },
            payment_method,
            client_subtotal,
        })
    }
}

#[derive(Default)]
struct FieldErrors(BTreeMap<String, String>);

impl FieldErrors {
    // First message per field wins.
    fn add(&mut self, field: impl Into<String>, message: impl fmt::Display) {
        self.0.entry(field.into()).or_insert_with(|| message.to_string());
    }

    fn into_result(self) -> Result<(), DraftErrors> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(DraftErrors { fields: self.0 })
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip separators; `None` if anything other than digits remains.
fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (prefix, rest) = match trimmed.strip_prefix('+') {
        Some(rest) => ("+", rest),
        None => ("", trimmed),
    };
    let mut digits = String::with_capacity(rest.len());
    for c in rest.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => return None,
        }
    }
    if digits.is_empty() {
        return None;
    }
    Some(format!("{prefix}{digits}"))
}

fn looks_like_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && domain.contains('.')
        && !value.contains(char::is_whitespace)
}
