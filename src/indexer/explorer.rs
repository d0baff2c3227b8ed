//! Etherscan-compatible explorer client used as the per-chain bridge log indexer

use super::{parse_quantity, IndexedLog, LogIndexer, LogQuery};
use crate::config::Settings;
use crate::error::{ReconcilerError, ReconcilerResult};

use async_trait::async_trait;
use ethers::types::{Address, H256};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

const INDEXER_NAME: &str = "explorer";
/// Page size requested from the explorer, the usual upper bound for getLogs
const PAGE_SIZE: usize = 1000;
/// Explorers refuse `page * offset` beyond 10 000 results per window
const MAX_PAGES: u32 = 10;

/// Explorer API endpoint for one chain
#[derive(Debug, Clone)]
pub struct ExplorerEndpoint {
    pub url: String,
    pub api_key: Option<String>,
}

/// Explorer-backed [`LogIndexer`].
///
/// Results come back oldest first in fixed-size pages. A search reads pages
/// until one comes back short; once the explorer's result window is
/// exhausted it restarts at the block of the last log seen.
#[derive(Debug, Clone)]
pub struct ExplorerLogIndexer {
    client: reqwest::Client,
    endpoints: HashMap<u64, ExplorerEndpoint>,
    max_pages: u32,
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExplorerLog {
    address: String,
    topics: Vec<Option<String>>,
    data: String,
    block_number: String,
    time_stamp: String,
    transaction_hash: String,
}

impl RawExplorerLog {
    fn into_log(self) -> Option<IndexedLog> {
        let topics = self
            .topics
            .into_iter()
            .flatten()
            .map(|t| H256::from_str(&t).ok())
            .collect::<Option<Vec<_>>>()?;

        Some(IndexedLog {
            address: Address::from_str(&self.address).ok()?,
            topics,
            data: hex::decode(self.data.trim_start_matches("0x")).ok()?,
            transaction_hash: H256::from_str(&self.transaction_hash).ok()?,
            block_number: parse_quantity(&self.block_number)?,
            timestamp: parse_quantity(&self.time_stamp)?,
        })
    }
}

impl ExplorerLogIndexer {
    pub fn new(client: reqwest::Client, endpoints: HashMap<u64, ExplorerEndpoint>) -> Self {
        Self {
            client,
            endpoints,
            max_pages: MAX_PAGES,
        }
    }

    /// Pages read before sliding the block window forward
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Build a client for every enabled chain in `settings`
    pub fn from_settings(settings: &Settings) -> ReconcilerResult<Self> {
        let client = build_client(settings.polling.request_timeout())?;
        let endpoints = settings
            .enabled_chains()
            .into_iter()
            .map(|(_, chain)| {
                (
                    chain.chain_id,
                    ExplorerEndpoint {
                        url: chain.log_indexer_url.clone(),
                        api_key: chain.log_indexer_api_key.clone().filter(|k| !k.is_empty()),
                    },
                )
            })
            .collect();
        Ok(Self::new(client, endpoints))
    }

    fn query_params(
        query: &LogQuery,
        from_block: u64,
        page: u32,
        api_key: Option<&str>,
    ) -> Vec<(String, String)> {
        let mut params = vec![
            ("module".to_string(), "logs".to_string()),
            ("action".to_string(), "getLogs".to_string()),
            ("address".to_string(), format!("{:?}", query.address)),
            ("fromBlock".to_string(), from_block.to_string()),
            ("toBlock".to_string(), "latest".to_string()),
            ("page".to_string(), page.to_string()),
            ("offset".to_string(), PAGE_SIZE.to_string()),
        ];

        let set: Vec<(usize, H256)> = query
            .topics
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.map(|t| (i, t)))
            .collect();

        for (i, topic) in &set {
            params.push((format!("topic{}", i), format!("{:?}", topic)));
        }
        for (a, (i, _)) in set.iter().enumerate() {
            for (j, _) in &set[a + 1..] {
                params.push((format!("topic{}_{}_opr", i, j), "and".to_string()));
            }
        }

        if let Some(key) = api_key {
            params.push(("apikey".to_string(), key.to_string()));
        }
        params
    }

    /// One page of results plus the number of raw entries it carried
    async fn fetch_page(
        &self,
        endpoint: &ExplorerEndpoint,
        query: &LogQuery,
        from_block: u64,
        page: u32,
    ) -> ReconcilerResult<(Vec<IndexedLog>, usize)> {
        let params = Self::query_params(query, from_block, page, endpoint.api_key.as_deref());
        let resp = self.client.get(&endpoint.url).query(&params).send().await?;

        match resp.status() {
            status if status.is_success() => {}
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(ReconcilerError::RateLimited {
                    indexer: INDEXER_NAME.to_string(),
                })
            }
            status => {
                return Err(ReconcilerError::Indexer {
                    indexer: INDEXER_NAME.to_string(),
                    message: format!("chain {} responded {}", query.chain_id, status),
                })
            }
        }

        let body: ExplorerResponse = resp.json().await?;
        let entries = match body.result {
            serde_json::Value::Array(entries) => entries,
            other => {
                if body.message.starts_with("No records found") {
                    return Ok((Vec::new(), 0));
                }
                let detail = other.as_str().unwrap_or(body.message.as_str()).to_string();
                if detail.to_ascii_lowercase().contains("rate limit") {
                    return Err(ReconcilerError::RateLimited {
                        indexer: INDEXER_NAME.to_string(),
                    });
                }
                return Err(ReconcilerError::Indexer {
                    indexer: INDEXER_NAME.to_string(),
                    message: format!("status {}: {}", body.status, detail),
                });
            }
        };

        let count = entries.len();
        let mut logs = Vec::with_capacity(count);
        for entry in entries {
            match serde_json::from_value::<RawExplorerLog>(entry)
                .ok()
                .and_then(RawExplorerLog::into_log)
            {
                Some(log) => logs.push(log),
                None => debug!("Skipping malformed log from chain {}", query.chain_id),
            }
        }
        Ok((logs, count))
    }
}

#[async_trait]
impl LogIndexer for ExplorerLogIndexer {
    async fn get_logs(&self, query: &LogQuery) -> ReconcilerResult<Vec<IndexedLog>> {
        let endpoint = self
            .endpoints
            .get(&query.chain_id)
            .ok_or(ReconcilerError::UnknownChain {
                chain_id: query.chain_id,
            })?;

        let mut logs: Vec<IndexedLog> = Vec::new();
        let mut from_block = query.from_block;
        let mut page = 1;
        let mut requests = 0;

        loop {
            let (batch, count) = self.fetch_page(endpoint, query, from_block, page).await?;
            requests += 1;
            logs.extend(batch);
            if count < PAGE_SIZE {
                break;
            }

            if page < self.max_pages {
                page += 1;
                continue;
            }

            // Window exhausted: restart at the last block, which may be partial
            let last_block = logs.last().map_or(from_block, |log| log.block_number);
            if last_block <= from_block {
                warn!(
                    "Chain {}: more than {} logs in block {} for {:?}, results truncated",
                    query.chain_id,
                    PAGE_SIZE * self.max_pages as usize,
                    from_block,
                    query.address
                );
                break;
            }
            logs.retain(|log| log.block_number < last_block);
            from_block = last_block;
            page = 1;
        }

        debug!(
            "Chain {}: {} logs for {:?} in {} requests",
            query.chain_id,
            logs.len(),
            query.address,
            requests
        );
        Ok(logs)
    }
}

pub(crate) fn build_client(timeout: Duration) -> ReconcilerResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(ReconcilerError::Http)
}
