use std::fmt;

use thiserror::Error;

/// Longest address accepted (RFC 5321 path limit).
const MAX_ADDRESS_LENGTH: usize = 254;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Sender address is empty")]
    Empty,
    #[error("Sender address is too long")]
    TooLong,
    #[error("Sender address is malformed: {0}")]
    InvalidFormat(String),
}

/// A sender address that passed validation. This is the subscriber identity.
///
/// Case is preserved: `A@example.com` and `a@example.com` are distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberAddress(String);

impl SubscriberAddress {
    /// Validate a raw `From` value.
    ///
    /// Accepts a bare `user@example.com` or the display form
    /// `Name <user@example.com>`, in which case only the bracketed part is
    /// kept.
    ///
    /// ```
    /// use rss_email::command::SubscriberAddress;
    ///
    /// let addr = SubscriberAddress::parse("Ada <ada@example.com>").unwrap();
    /// assert_eq!(addr.as_str(), "ada@example.com");
    /// assert!(SubscriberAddress::parse("not-an-address").is_err());
    /// ```
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let trimmed = raw.trim();
        let candidate = match (trimmed.rfind('<'), trimmed.ends_with('>')) {
            (Some(start), true) => &trimmed[start + 1..trimmed.len() - 1],
            _ => trimmed,
        };

        if candidate.is_empty() {
            return Err(AddressError::Empty);
        }
        if candidate.len() > MAX_ADDRESS_LENGTH {
            return Err(AddressError::TooLong);
        }
        if candidate
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '<' || c == '>')
        {
            return Err(AddressError::InvalidFormat(candidate.to_owned()));
        }

        let Some((local, domain)) = candidate.split_once('@') else {
            return Err(AddressError::InvalidFormat(candidate.to_owned()));
        };
        if local.is_empty() || domain.contains('@') || !domain.contains('.') {
            return Err(AddressError::InvalidFormat(candidate.to_owned()));
        }
        if domain.split('.').any(str::is_empty) {
            return Err(AddressError::InvalidFormat(candidate.to_owned()));
        }

        Ok(Self(candidate.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for SubscriberAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_addresses() {
        assert!(SubscriberAddress::parse("a@example.com").is_ok());
        assert!(SubscriberAddress::parse("first.last+rss@mail.example.org").is_ok());
    }

    #[test]
    fn test_case_is_preserved() {
        let addr = SubscriberAddress::parse("Ada@Example.com").unwrap();
        assert_eq!(addr.as_str(), "Ada@Example.com");
    }

    #[test]
    fn test_display_name_form() {
        let addr = SubscriberAddress::parse("  \"Ada L.\" <ada@example.com> ").unwrap();
        assert_eq!(addr.to_string(), "ada@example.com");
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(SubscriberAddress::parse(""), Err(AddressError::Empty));
        assert_eq!(SubscriberAddress::parse("<>"), Err(AddressError::Empty));
        assert!(SubscriberAddress::parse("no-at-sign").is_err());
        assert!(SubscriberAddress::parse("@example.com").is_err());
        assert!(SubscriberAddress::parse("a@localhost").is_err());
        assert!(SubscriberAddress::parse("a@example..com").is_err());
        assert!(SubscriberAddress::parse("a b@example.com").is_err());
        assert!(SubscriberAddress::parse("a@b@example.com").is_err());
    }

    #[test]
    fn test_rejects_too_long() {
        let long = format!("{}@example.com", "a".repeat(250));
        assert_eq!(SubscriberAddress::parse(&long), Err(AddressError::TooLong));
    }
}
