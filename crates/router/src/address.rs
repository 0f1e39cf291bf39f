use std::fmt;
use std::str::FromStr;

use agentmesh_core::RoutingError;

/// A parsed `scheme:destination` target.
///
/// Only the first `:` separates; the destination keeps any further colons
/// (`webhook:https://host/path` has destination `https://host/path`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingAddress {
    pub scheme: String,
    pub destination: String,
}

impl RoutingAddress {
    pub fn parse(address: &str) -> Result<Self, RoutingError> {
        match address.split_once(':') {
            Some((scheme, destination)) if !scheme.is_empty() => Ok(Self {
                scheme: scheme.to_string(),
                destination: destination.to_string(),
            }),
            _ => Err(RoutingError::MalformedAddress(address.to_string())),
        }
    }
}

impl FromStr for RoutingAddress {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RoutingAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let addr = RoutingAddress::parse("nats:orders.created").unwrap();
        assert_eq!(addr.scheme, "nats");
        assert_eq!(addr.destination, "orders.created");
        assert_eq!(addr.to_string(), "nats:orders.created");
    }

    #[test]
    fn test_splits_on_first_colon_only() {
        let addr: RoutingAddress = "sns:arn:aws:sns:us-east-1:123:topic".parse().unwrap();
        assert_eq!(addr.scheme, "sns");
        assert_eq!(addr.destination, "arn:aws:sns:us-east-1:123:topic");
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            RoutingAddress::parse("badaddress"),
            Err(RoutingError::MalformedAddress(a)) if a == "badaddress"
        ));
        assert!(matches!(
            RoutingAddress::parse(":orders"),
            Err(RoutingError::MalformedAddress(_))
        ));
    }

    #[test]
    fn test_scheme_is_case_sensitive() {
        let addr = RoutingAddress::parse("NATS:x").unwrap();
        assert_eq!(addr.scheme, "NATS");
    }
}
