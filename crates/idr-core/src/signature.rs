use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// Dot-atom local part, then one or more DNS labels. Single-label domains are accepted.
static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+(\.[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+)*",
        r"@[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?",
        r"(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$",
    ))
    .unwrap()
});

/// The contact details supplied by one interaction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "text_or_number")]
    pub phone_number: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TextOrNumber {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

/// Phone numbers arrive as strings, but JSON clients often send them bare.
fn text_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<TextOrNumber>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        TextOrNumber::Text(s) => s,
        TextOrNumber::Signed(n) => n.to_string(),
        TextOrNumber::Unsigned(n) => n.to_string(),
    }))
}

impl Signature {
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
        }
    }

    /// Trim both fields; blank values become absent.
    pub fn normalized(&self) -> Self {
        Self {
            email: clean(self.email.as_deref()),
            phone_number: clean(self.phone_number.as_deref()),
        }
    }

    /// Normalize and check the signature is usable for reconciliation.
    pub fn validate(&self) -> Result<Self, ValidationError> {
        let sig = self.normalized();
        if sig.is_empty() {
            return Err(ValidationError::NoContactMethod);
        }
        if let Some(email) = &sig.email
            && !is_valid_email(email)
        {
            return Err(ValidationError::MalformedEmail);
        }
        Ok(sig)
    }

    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone_number.is_none()
    }
}

fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn is_valid_email(email: &str) -> bool {
    email.len() <= 254 && EMAIL.is_match(email)
}
