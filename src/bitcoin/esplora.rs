//! Esplora-backed Bitcoin RPC
//!
//! Thin REST client over a Blockstream-style Esplora API. Only the endpoints
//! the bridge needs: tip height, headers by height, merkle proofs, and
//! main-chain membership checks.

use async_trait::async_trait;
use bitcoin::block::Header;
use bitcoin::consensus::encode::deserialize;
use reqwest::Client;
use serde::Deserialize;

use super::{display_hex_to_internal, BitcoinRpc, BlockHeaderInfo, BtcRpcError, MerkleProofInfo};

/// Esplora HTTP client
#[derive(Debug, Clone)]
pub struct EsploraRpc {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct EsploraBlockStatus {
    in_best_chain: bool,
    height: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EsploraTxStatus {
    confirmed: bool,
    block_height: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EsploraMerkleProof {
    block_height: u64,
    merkle: Vec<String>,
    pos: u32,
}

impl EsploraRpc {
    /// Create a new client with a custom base URL
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_text(&self, path: &str) -> Result<String, BtcRpcError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(BtcRpcError::NotFound(path.to_string()));
        }
        Ok(resp.text().await?)
    }
}

#[async_trait]
impl BitcoinRpc for EsploraRpc {
    async fn tip_height(&self) -> Result<u64, BtcRpcError> {
        self.get_text("/blocks/tip/height")
            .await?
            .trim()
            .parse()
            .map_err(|_| BtcRpcError::Malformed("tip height".to_string()))
    }

    async fn block_hash_at(&self, height: u64) -> Result<String, BtcRpcError> {
        Ok(self
            .get_text(&format!("/block-height/{}", height))
            .await?
            .trim()
            .to_string())
    }

    async fn block_header(&self, block_hash: &str) -> Result<Header, BtcRpcError> {
        let header_hex = self.get_text(&format!("/block/{}/header", block_hash)).await?;
        let bytes = hex::decode(header_hex.trim())
            .map_err(|e| BtcRpcError::Malformed(format!("header hex: {}", e)))?;
        deserialize(&bytes).map_err(|e| BtcRpcError::Malformed(format!("header: {}", e)))
    }

    async fn headers_from(
        &self,
        start_height: u64,
        count: usize,
    ) -> Result<Vec<BlockHeaderInfo>, BtcRpcError> {
        let mut headers = Vec::with_capacity(count);
        for height in start_height..start_height + count as u64 {
            let hash = match self.block_hash_at(height).await {
                Ok(hash) => hash,
                // Ran past the tip; return what we have.
                Err(BtcRpcError::NotFound(_)) => break,
                Err(e) => return Err(e),
            };
            let header = self.block_header(&hash).await?;
            if header.block_hash().to_string() != hash {
                return Err(BtcRpcError::Malformed(format!(
                    "header at {} does not hash to {}",
                    height, hash
                )));
            }
            headers.push(BlockHeaderInfo {
                height,
                hash,
                header,
            });
        }
        Ok(headers)
    }

    async fn merkle_proof(&self, txid: &str) -> Result<MerkleProofInfo, BtcRpcError> {
        let url = format!("{}/tx/{}/merkle-proof", self.base_url, txid);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(BtcRpcError::NotFound(format!("merkle proof for {}", txid)));
        }
        let proof: EsploraMerkleProof = resp.json().await?;

        let mut siblings = Vec::with_capacity(proof.merkle.len());
        for sibling in &proof.merkle {
            siblings.push(display_hex_to_internal(sibling)?);
        }

        Ok(MerkleProofInfo {
            reversed_txid: display_hex_to_internal(txid)?,
            siblings,
            block_height: proof.block_height as u32,
            position: proof.pos,
        })
    }

    async fn is_in_main_chain(&self, block_hash: &str, height: u64) -> Result<bool, BtcRpcError> {
        let url = format!("{}/block/{}/status", self.base_url, block_hash);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Ok(false);
        }
        let status: EsploraBlockStatus = resp.json().await?;
        Ok(status.in_best_chain && status.height == Some(height))
    }

    async fn raw_transaction(&self, txid: &str) -> Result<Vec<u8>, BtcRpcError> {
        let tx_hex = self.get_text(&format!("/tx/{}/hex", txid)).await?;
        hex::decode(tx_hex.trim()).map_err(|e| BtcRpcError::Malformed(format!("tx hex: {}", e)))
    }

    async fn transaction_height(&self, txid: &str) -> Result<Option<u64>, BtcRpcError> {
        let url = format!("{}/tx/{}/status", self.base_url, txid);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(BtcRpcError::NotFound(format!("tx {}", txid)));
        }
        let status: EsploraTxStatus = resp.json().await?;
        if status.confirmed {
            Ok(status.block_height)
        } else {
            Ok(None)
        }
    }
}
