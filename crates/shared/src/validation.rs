//! Form validation. Runs before any store call, so failures never reach a
//! store; each invalid field carries the message the form displays.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+'-]+@([A-Za-z0-9-]+\.)+[A-Za-z]{2,}$").expect("valid email regex")
});

static PHONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{10}$").expect("valid phone regex"));

/// Per-field validation messages. Only the first message for a field is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("invalid fields: {}", field_list(.fields))]
pub struct ValidationErrors {
    fields: BTreeMap<&'static str, String>,
}

impl ValidationErrors {
    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.fields.entry(field).or_insert_with(|| message.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.fields.iter().map(|(field, msg)| (*field, msg.as_str()))
    }

    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

fn field_list(fields: &BTreeMap<&'static str, String>) -> String {
    fields.keys().copied().collect::<Vec<_>>().join(", ")
}

pub(crate) fn required(
    errors: &mut ValidationErrors,
    field: &'static str,
    value: &str,
    message: &str,
) {
    if value.trim().is_empty() {
        errors.add(field, message);
    }
}

pub(crate) fn email(errors: &mut ValidationErrors, value: &str) {
    if value.trim().is_empty() {
        errors.add("email", "Email is required");
    } else if !EMAIL_RE.is_match(value) {
        errors.add("email", "Invalid email");
    }
}

pub(crate) fn phone(errors: &mut ValidationErrors, value: &str) {
    if value.is_empty() {
        errors.add("phone", "Phone number is required");
    } else if !PHONE_RE.is_match(value) {
        errors.add("phone", "Phone number must be 10 digits");
    }
}
