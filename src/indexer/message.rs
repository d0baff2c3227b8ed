//! Message-status indexer client for the message bridge

use super::explorer::build_client;
use super::{parse_quantity, MessageState, MessageStatus, MessageStatusIndexer};
use crate::config::Settings;
use crate::error::{ReconcilerError, ReconcilerResult};

use async_trait::async_trait;
use ethers::types::H256;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use tracing::debug;

const INDEXER_NAME: &str = "message-indexer";

/// HTTP [`MessageStatusIndexer`] resolving `GET {base_url}/{message_id}`
#[derive(Debug, Clone)]
pub struct HttpMessageIndexer {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRecord {
    #[serde(default)]
    state: Option<Value>,
    #[serde(default)]
    dest_chain_id: Option<Value>,
    #[serde(default, alias = "destTransactionHash")]
    receipt_transaction_hash: Option<String>,
}

impl MessageRecord {
    fn into_status(self) -> MessageStatus {
        let state = match self.state {
            Some(Value::Number(n)) => match n.as_u64() {
                Some(2) => MessageState::Delivered,
                Some(3) => MessageState::Failed,
                _ => MessageState::InFlight,
            },
            Some(Value::String(s)) => match s.to_ascii_uppercase().as_str() {
                "SUCCESS" | "DELIVERED" => MessageState::Delivered,
                "FAILURE" | "FAILED" => MessageState::Failed,
                _ => MessageState::InFlight,
            },
            _ => MessageState::InFlight,
        };

        let destination_chain_id = match self.dest_chain_id {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => parse_quantity(&s),
            _ => None,
        };

        MessageStatus {
            state,
            destination_chain_id,
            destination_tx_hash: self
                .receipt_transaction_hash
                .and_then(|h| H256::from_str(&h).ok()),
        }
    }
}

impl HttpMessageIndexer {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn from_settings(settings: &Settings) -> ReconcilerResult<Self> {
        let client = build_client(settings.polling.request_timeout())?;
        Ok(Self::new(
            client,
            settings.message_indexer.base_url.clone(),
            settings.message_indexer.api_key.clone().filter(|k| !k.is_empty()),
        ))
    }
}

#[async_trait]
impl MessageStatusIndexer for HttpMessageIndexer {
    async fn message_status(&self, message_id: H256) -> ReconcilerResult<Option<MessageStatus>> {
        let url = format!("{}/{:?}", self.base_url, message_id);
        let req = self.client.get(&url);
        let req = match self.api_key.as_deref() {
            Some(key) => req.header("x-api-key", key),
            None => req,
        };

        let resp = req.send().await?;
        match resp.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                debug!("Message {:?} not indexed yet", message_id);
                return Ok(None);
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(ReconcilerError::RateLimited {
                    indexer: INDEXER_NAME.to_string(),
                })
            }
            status => {
                return Err(ReconcilerError::Indexer {
                    indexer: INDEXER_NAME.to_string(),
                    message: format!("message {:?} responded {}", message_id, status),
                })
            }
        }

        let record: MessageRecord = resp.json().await?;
        Ok(Some(record.into_status()))
    }
}
