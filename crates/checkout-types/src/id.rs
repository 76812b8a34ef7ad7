//! Typed identifiers for aggregates and records.
//!
//! Every aggregate gets its own UUID-backed id newtype so that, say, an
//! [`InvoiceId`] can never be passed where a [`MerchantId`] is expected.
//! Ids serialize as plain UUID strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
#[error("Invalid id: {0}")]
pub struct IdParseError(String);

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| IdParseError(s.to_string()))
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

uuid_id!(
    /// Identifies a merchant aggregate.
    MerchantId
);
uuid_id!(
    /// Identifies an invoice aggregate.
    InvoiceId
);
uuid_id!(
    /// Identifies a payment aggregate.
    PaymentId
);
uuid_id!(
    /// Identifies a settlement record.
    SettlementId
);
uuid_id!(
    /// Identifies an API key. The id is public; the key body is not.
    ApiKeyId
);
uuid_id!(
    /// Identifies a webhook endpoint subscription.
    EndpointId
);
uuid_id!(
    /// Identifies a single webhook delivery (one event to one endpoint).
    DeliveryId
);
uuid_id!(
    /// Identifies a persisted domain event.
    EventId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_parse_roundtrip() {
        let id = InvoiceId::generate();
        let parsed: InvoiceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_id_serde_is_transparent() {
        let id = MerchantId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn test_id_parse_rejects_garbage() {
        assert!("not-a-uuid".parse::<PaymentId>().is_err());
    }
}
