//! Bridge event topics and identifier decoding
//!
//! Defines the events the reconciler tracks (bridge deposits, relay fills,
//! message sends, pivot initiations) and how a hop identifier is read from
//! each of them.

pub mod extractor;

pub use extractor::{HistoryQuery, IdentifierExtractor};

use crate::config::{EventConfig, EventsConfig};
use crate::coordination::topology::Medium;
use crate::indexer::IndexedLog;

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;

/// Location of a 32-byte word inside a log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierField {
    /// `topics[n]`, topic 0 being the event signature
    Topic(usize),
    /// The n-th 32-byte word of the non-indexed data
    Data(usize),
}

impl IdentifierField {
    /// Read the word at this location, `None` if the log is too short
    pub fn word(&self, log: &IndexedLog) -> Option<H256> {
        match *self {
            IdentifierField::Topic(index) => log.topics.get(index).copied(),
            IdentifierField::Data(index) => {
                let start = index.checked_mul(32)?;
                log.data.get(start..start + 32).map(H256::from_slice)
            }
        }
    }

    /// Topic position usable as an indexer filter, if the field is indexed
    pub fn topic_index(&self) -> Option<usize> {
        match *self {
            IdentifierField::Topic(index) => Some(index),
            IdentifierField::Data(_) => None,
        }
    }
}

/// Bridge-assigned identifier of a hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HopIdentifier {
    /// Asset-bridge deposit id
    DepositId(U256),
    /// Message-bridge message id
    MessageId(H256),
}

impl HopIdentifier {
    /// Interpret a raw log word as the identifier of `medium`
    pub fn from_word(medium: Medium, word: H256) -> Self {
        match medium {
            Medium::AssetBridge => HopIdentifier::DepositId(U256::from_big_endian(word.as_bytes())),
            Medium::MessageBridge => HopIdentifier::MessageId(word),
        }
    }

    /// The identifier as a 32-byte word, as it appears in topics
    pub fn as_word(&self) -> H256 {
        match self {
            HopIdentifier::DepositId(id) => {
                let mut buf = [0u8; 32];
                id.to_big_endian(&mut buf);
                H256::from(buf)
            }
            HopIdentifier::MessageId(id) => *id,
        }
    }
}

impl fmt::Display for HopIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HopIdentifier::DepositId(id) => write!(f, "{}", id),
            HopIdentifier::MessageId(id) => write!(f, "0x{}", hex::encode(id.as_bytes())),
        }
    }
}

/// Tracked event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AssetDeposit,
    RelayFilled,
    MessageSent,
    PivotInitiated,
}

impl EventKind {
    /// Event emitted on the source chain when a hop of `medium` is sent
    pub fn send_event(medium: Medium) -> Self {
        match medium {
            Medium::AssetBridge => EventKind::AssetDeposit,
            Medium::MessageBridge => EventKind::MessageSent,
        }
    }
}

/// A resolved event: topic hash plus identifier location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSpec {
    pub kind: EventKind,
    pub signature: String,
    pub topic: H256,
    pub identifier: IdentifierField,
}

impl EventSpec {
    fn from_config(kind: EventKind, config: &EventConfig) -> Self {
        Self {
            kind,
            signature: config.signature.clone(),
            topic: event_topic(&config.signature),
            identifier: config.identifier,
        }
    }

    /// Whether `log` is an instance of this event
    pub fn matches(&self, log: &IndexedLog) -> bool {
        log.topics.first() == Some(&self.topic)
    }
}

/// All tracked events, built once from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCatalog {
    pub asset_deposit: EventSpec,
    pub relay_filled: EventSpec,
    pub relay_origin_chain: Option<IdentifierField>,
    pub message_sent: EventSpec,
    pub pivot_initiated: EventSpec,
}

impl EventCatalog {
    pub fn from_config(config: &EventsConfig) -> Self {
        Self {
            asset_deposit: EventSpec::from_config(EventKind::AssetDeposit, &config.asset_deposit),
            relay_filled: EventSpec::from_config(EventKind::RelayFilled, &config.relay_filled),
            relay_origin_chain: config.relay_origin_chain,
            message_sent: EventSpec::from_config(EventKind::MessageSent, &config.message_sent),
            pivot_initiated: EventSpec::from_config(
                EventKind::PivotInitiated,
                &config.pivot_initiated,
            ),
        }
    }

    pub fn get(&self, kind: EventKind) -> &EventSpec {
        match kind {
            EventKind::AssetDeposit => &self.asset_deposit,
            EventKind::RelayFilled => &self.relay_filled,
            EventKind::MessageSent => &self.message_sent,
            EventKind::PivotInitiated => &self.pivot_initiated,
        }
    }

    /// Send event for hops of `medium`
    pub fn send_event(&self, medium: Medium) -> &EventSpec {
        self.get(EventKind::send_event(medium))
    }
}

impl Default for EventCatalog {
    fn default() -> Self {
        Self::from_config(&EventsConfig::default())
    }
}

/// keccak-256 of a canonical event signature
pub fn event_topic(signature: &str) -> H256 {
    H256::from_slice(&Keccak256::digest(signature.as_bytes()))
}

/// Whether the log payload embeds `account`.
///
/// The pool contracts do not index the depositor, so the address is matched as
/// a raw byte sequence anywhere in the data. A coincidental match inside an
/// unrelated field is possible.
pub fn references_account(log: &IndexedLog, account: Address) -> bool {
    let needle = account.as_bytes();
    log.data.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_event_topic_matches_known_hash() {
        let transfer = event_topic("Transfer(address,address,uint256)");
        assert_eq!(
            transfer,
            H256::from_str("0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef")
                .unwrap()
        );
    }

    #[test]
    fn test_identifier_field_word() {
        let mut data = vec![0u8; 64];
        data[63] = 9;
        let log = IndexedLog {
            topics: vec![H256::repeat_byte(1), H256::from_low_u64_be(5)],
            data,
            ..Default::default()
        };

        assert_eq!(IdentifierField::Topic(1).word(&log), Some(H256::from_low_u64_be(5)));
        assert_eq!(IdentifierField::Data(1).word(&log), Some(H256::from_low_u64_be(9)));
        assert_eq!(IdentifierField::Topic(3).word(&log), None);
        assert_eq!(IdentifierField::Data(2).word(&log), None);
    }

    #[test]
    fn test_identifier_display() {
        let deposit = HopIdentifier::from_word(Medium::AssetBridge, H256::from_low_u64_be(1234));
        assert_eq!(deposit.to_string(), "1234");
        assert_eq!(deposit.as_word(), H256::from_low_u64_be(1234));

        let message = HopIdentifier::from_word(Medium::MessageBridge, H256::repeat_byte(0xab));
        assert_eq!(message.to_string(), format!("0x{}", "ab".repeat(32)));
    }

    #[test]
    fn test_references_account() {
        let account = Address::repeat_byte(0x5e);
        let mut data = vec![0u8; 64];
        data[44..64].copy_from_slice(account.as_bytes());
        let log = IndexedLog {
            data,
            ..Default::default()
        };

        assert!(references_account(&log, account));
        assert!(!references_account(&log, Address::repeat_byte(0x11)));
    }

    #[test]
    fn test_references_account_ignores_nibble_offsets() {
        // 0x12 repeated shifted by half a byte spells 0x21 repeated in hex
        let mut data = vec![0x12u8; 22];
        data[0] = 0x02;
        data[21] = 0x10;
        let log = IndexedLog {
            data,
            ..Default::default()
        };

        assert!(!references_account(&log, Address::repeat_byte(0x21)));
        assert!(references_account(&log, Address::repeat_byte(0x12)));
    }

    #[test]
    fn test_identifier_field_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            identifier: IdentifierField,
        }
        let parsed: Wrapper = toml::from_str("identifier = { data = 3 }").unwrap();
        assert_eq!(parsed.identifier, IdentifierField::Data(3));
    }
}
