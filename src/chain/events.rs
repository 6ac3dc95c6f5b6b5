//! Program Event Scanning
//!
//! Both on-chain programs emit events as `Program data: <base64>` log lines,
//! a 1-byte tag followed by a borsh payload. The scanner walks an address's
//! transaction history backward (newest first) page by page, optionally
//! bounded by a page budget and a cancellation token.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use tokio_util::sync::CancellationToken;

use super::rpc::{ChainRpc, RpcError};

/// Log line prefix for program events
pub const PROGRAM_DATA_PREFIX: &str = "Program data: ";

/// Default signatures fetched per page
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// A decoded event occurrence: tag + payload plus its provenance
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub tag: u8,
    pub data: Vec<u8>,
    pub signature: Signature,
    pub slot: u64,
}

/// Decode one log line into (tag, payload), `None` for non-event lines
pub fn parse_program_data_line(line: &str) -> Option<(u8, Vec<u8>)> {
    let encoded = line.strip_prefix(PROGRAM_DATA_PREFIX)?;
    let bytes = BASE64.decode(encoded).ok()?;
    if bytes.is_empty() {
        return None;
    }
    Some((bytes[0], bytes[1..].to_vec()))
}

/// One page of events plus the cursor for the next (older) page
#[derive(Debug)]
pub struct EventPage {
    pub events: Vec<RawEvent>,
    /// Pass as `before` to fetch the next page; `None` when history is exhausted
    pub next_cursor: Option<Signature>,
}

/// Backward scanner over a program address's event history
pub struct EventScanner<'a> {
    rpc: &'a dyn ChainRpc,
    address: Pubkey,
    page_size: usize,
}

impl<'a> EventScanner<'a> {
    pub fn new(rpc: &'a dyn ChainRpc, address: Pubkey) -> Self {
        Self {
            rpc,
            address,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Fetch one page of events, skipping failed transactions
    pub async fn fetch_page(&self, before: Option<Signature>) -> Result<EventPage, RpcError> {
        let infos = self
            .rpc
            .signatures_for_address(&self.address, before, self.page_size)
            .await?;

        let next_cursor = if infos.len() < self.page_size {
            None
        } else {
            infos.last().map(|i| i.signature)
        };

        let mut events = Vec::new();
        for info in &infos {
            if info.err {
                continue;
            }
            let logs = self.rpc.transaction_logs(&info.signature).await?;
            for line in &logs {
                if let Some((tag, data)) = parse_program_data_line(line) {
                    events.push(RawEvent {
                        tag,
                        data,
                        signature: info.signature,
                        slot: info.slot,
                    });
                }
            }
        }

        Ok(EventPage {
            events,
            next_cursor,
        })
    }

    /// Walk history newest-to-oldest until `visit` produces a value.
    ///
    /// Returns `Ok(None)` when history (or the page budget) is exhausted
    /// without a match. Cancellation is checked between pages.
    pub async fn find_map<T, F>(
        &self,
        mut visit: F,
        cancel: Option<&CancellationToken>,
        max_pages: Option<usize>,
    ) -> Result<Option<T>, RpcError>
    where
        F: FnMut(&RawEvent) -> Option<T> + Send,
    {
        let mut before = None;
        let mut pages = 0usize;

        loop {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(RpcError::Cancelled);
                }
            }

            let page = self.fetch_page(before).await?;
            for event in &page.events {
                if let Some(found) = visit(event) {
                    return Ok(Some(found));
                }
            }

            pages += 1;
            if let Some(limit) = max_pages {
                if pages >= limit {
                    return Ok(None);
                }
            }
            match page.next_cursor {
                Some(cursor) => before = Some(cursor),
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::rpc::{MockChainRpc, SignatureInfo};

    #[test]
    fn test_parse_program_data_line() {
        // tag 0x02 followed by payload [0xaa, 0xbb]
        let encoded = BASE64.encode([0x02u8, 0xaa, 0xbb]);
        let line = format!("{}{}", PROGRAM_DATA_PREFIX, encoded);
        let (tag, data) = parse_program_data_line(&line).unwrap();
        assert_eq!(tag, 0x02);
        assert_eq!(data, vec![0xaa, 0xbb]);

        assert!(parse_program_data_line("Program log: hello").is_none());
        assert!(parse_program_data_line("Program data: !!!").is_none());
    }

    #[tokio::test]
    async fn test_find_map_stops_at_page_budget() {
        let mut rpc = MockChainRpc::new();
        let sig = Signature::default();
        // Every page is full, so the scanner would walk forever without the cap.
        rpc.expect_signatures_for_address().times(2).returning(move |_, _, limit| {
            Ok((0..limit)
                .map(|i| SignatureInfo {
                    signature: sig,
                    slot: 100 - i as u64,
                    err: false,
                    block_time: None,
                })
                .collect())
        });
        rpc.expect_transaction_logs()
            .returning(|_| Ok(vec!["Program log: noise".to_string()]));

        let scanner = EventScanner::new(&rpc, Pubkey::new_unique());
        let found: Option<()> = scanner.find_map(|_| None, None, Some(2)).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_find_map_respects_cancellation() {
        let mut rpc = MockChainRpc::new();
        rpc.expect_signatures_for_address().never();

        let token = CancellationToken::new();
        token.cancel();

        let scanner = EventScanner::new(&rpc, Pubkey::new_unique());
        let result: Result<Option<()>, _> = scanner.find_map(|_| None, Some(&token), None).await;
        assert!(matches!(result, Err(RpcError::Cancelled)));
    }

    #[tokio::test]
    async fn test_find_map_skips_failed_transactions() {
        let mut rpc = MockChainRpc::new();
        let good = Signature::from([1u8; 64]);
        let bad = Signature::from([2u8; 64]);
        rpc.expect_signatures_for_address().returning(move |_, _, _| {
            Ok(vec![
                SignatureInfo {
                    signature: bad,
                    slot: 9,
                    err: true,
                    block_time: None,
                },
                SignatureInfo {
                    signature: good,
                    slot: 8,
                    err: false,
                    block_time: None,
                },
            ])
        });
        let payload = BASE64.encode([7u8, 1, 2, 3]);
        rpc.expect_transaction_logs()
            .withf(move |s| *s == good)
            .returning(move |_| Ok(vec![format!("{}{}", PROGRAM_DATA_PREFIX, payload)]));

        let scanner = EventScanner::new(&rpc, Pubkey::new_unique());
        let tag = scanner
            .find_map(|ev| Some(ev.tag), None, Some(1))
            .await
            .unwrap();
        assert_eq!(tag, Some(7));
    }
}
