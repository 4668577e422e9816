use serde::{Deserialize, Serialize};

/// An email address with optional display name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub address: String,
}

impl EmailAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    pub fn with_name(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: address.into(),
        }
    }

    /// Parse an address from a string like `"John Doe" <john@example.com>`
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"').trim();
            let address = s[angle_start + 1..angle_end].trim();
            return Self {
                name: (!name.is_empty()).then(|| name.to_string()),
                address: address.to_string(),
            };
        }

        Self::new(s)
    }

    /// Parse a comma separated address list, skipping empty entries
    pub fn parse_list(s: &str) -> Vec<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Self::parse)
            .collect()
    }

    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.address),
            None => self.address.clone(),
        }
    }
}
