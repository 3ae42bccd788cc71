//! Transfer payload wire format.
//!
//! What a sender pushes through the peer channel once its transfer is
//! final:
//!
//! ```json
//! { "sourceToken": { ...token object... }, "transferTx": { ...transaction... } }
//! ```
//!
//! Unknown top-level fields are ignored so newer senders can add fields
//! without breaking older receivers.

use serde::{Deserialize, Serialize};

use crate::token::object::TokenObject;
use crate::token::predicate::Address;
use crate::transfer::commitment::TransferTransaction;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPayload {
    /// The token as the sender held it, before the transfer.
    pub source_token: TokenObject,
    pub transfer_tx: TransferTransaction,
}

impl TransferPayload {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Who a transfer goes to: the peer that receives the payload, and the
/// address the token is committed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub peer_id: String,
    pub address: Address,
}

impl Recipient {
    pub fn new(peer_id: impl Into<String>, address: Address) -> Self {
        Self {
            peer_id: peer_id.into(),
            address,
        }
    }

    /// Pay to a nametag. The peer is reached by the same name.
    pub fn nametag(name: &str) -> Self {
        Self::new(crate::token::predicate::normalize_nametag(name), Address::for_nametag(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nametag_recipient_normalizes_peer() {
        let r = Recipient::nametag("@Bob");
        assert_eq!(r.peer_id, "bob");
        assert_eq!(r.address, Address::for_nametag("bob"));
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(TransferPayload::from_json("{\"sourceToken\": 1}").is_err());
        assert!(TransferPayload::from_json("[]").is_err());
    }
}
