// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    crypto::ProofNode,
    runtime::{Handle, JoinHandle},
    types::{
        as_string, Block, BlockError, BlockHash, BlockId, ChainLink, Height, MergerIndex,
        TimestampSecs, Transaction, TransactionId,
    },
};

/// Reply error type for a block that neither the pool nor the chain holds.
pub const ERROR_NO_BLOCK: u8 = 88;
pub const ERROR_UNKNOWN: u8 = 0;

const INBOUND_BUFFER: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ReqBlock = 0x32,
    Block = 0xB4,
    /// Chain info announced for every linked block.
    BlockHeight = 0xB6,
    ReqCheck = 0xC0,
    ResCheck = 0xC1,
    ReqStatus = 0xC2,
    ResStatus = 0xC3,
    Error = 0xFF,
}

impl TryFrom<u8> for MessageType {
    type Error = MessageError;

    fn try_from(code: u8) -> Result<Self, MessageError> {
        let kind = match code {
            0x32 => Self::ReqBlock,
            0xB4 => Self::Block,
            0xB6 => Self::BlockHeight,
            0xC0 => Self::ReqCheck,
            0xC1 => Self::ResCheck,
            0xC2 => Self::ReqStatus,
            0xC3 => Self::ResStatus,
            0xFF => Self::Error,
            _ => return Err(MessageError::UnknownType(code)),
        };
        Ok(kind)
    }
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> u8 {
        kind as u8
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
    #[error("malformed message body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed block: {0}")]
    Block(#[from] BlockError),
}

#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub kind: MessageType,
    pub sender: MergerIndex,
    pub body: String,
}

impl InboundMessage {
    pub fn new<T: Serialize>(
        kind: MessageType,
        sender: MergerIndex,
        body: &T,
    ) -> Result<Self, MessageError> {
        Ok(Self {
            kind,
            sender,
            body: serde_json::to_string(body)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// A message leaving the node; no receivers means every peer.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub kind: MessageType,
    pub receivers: Vec<MergerIndex>,
    pub body: String,
}

impl OutboundMessage {
    pub fn broadcast<T: Serialize>(kind: MessageType, body: &T) -> Result<Self, MessageError> {
        Self::to_receivers(kind, Vec::new(), body)
    }

    pub fn to<T: Serialize>(
        kind: MessageType,
        receiver: MergerIndex,
        body: &T,
    ) -> Result<Self, MessageError> {
        Self::to_receivers(kind, vec![receiver], body)
    }

    pub fn to_receivers<T: Serialize>(
        kind: MessageType,
        receivers: Vec<MergerIndex>,
        body: &T,
    ) -> Result<Self, MessageError> {
        Ok(Self {
            kind,
            receivers,
            body: serde_json::to_string(body)?,
        })
    }

    pub fn is_broadcast(&self) -> bool {
        self.receivers.is_empty()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(de::Error::custom)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockMessage {
    #[serde(rename = "mID", with = "as_string")]
    pub merger: MergerIndex,
    #[serde(rename = "blockraw", with = "base64_bytes")]
    pub raw: Vec<u8>,
    #[serde(rename = "tx", default)]
    pub transactions: Vec<Transaction>,
}

impl BlockMessage {
    pub fn new(merger: MergerIndex, block: &Block) -> Self {
        Self {
            merger,
            raw: block.raw().to_vec(),
            transactions: block.transactions().to_vec(),
        }
    }

    pub fn into_block(self) -> Result<Block, MessageError> {
        Ok(Block::from_raw(self.raw.into(), self.transactions)?)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReqBlockMessage {
    #[serde(rename = "mID", with = "as_string")]
    pub merger: MergerIndex,
    #[serde(with = "as_string")]
    pub time: TimestampSecs,
    /// Zero asks for the latest block.
    #[serde(rename = "hgt", with = "as_string")]
    pub height: Height,
    #[serde(rename = "prevHash", default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<BlockHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<BlockHash>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockHeightMessage {
    #[serde(rename = "mID", with = "as_string")]
    pub merger: MergerIndex,
    #[serde(with = "as_string")]
    pub time: TimestampSecs,
    #[serde(rename = "hgt", with = "as_string")]
    pub height: Height,
    #[serde(rename = "bID")]
    pub block_id: BlockId,
    #[serde(rename = "prevbID")]
    pub prev_block_id: BlockId,
    #[serde(rename = "prevHash")]
    pub prev_hash: BlockHash,
}

impl BlockHeightMessage {
    pub fn new(merger: MergerIndex, time: TimestampSecs, block: &Block) -> Self {
        Self {
            merger,
            time,
            height: block.height(),
            block_id: block.id(),
            prev_block_id: block.prev_id(),
            prev_hash: block.prev_hash(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReqStatusMessage {
    #[serde(rename = "mID", with = "as_string")]
    pub merger: MergerIndex,
    #[serde(with = "as_string")]
    pub time: TimestampSecs,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResStatusMessage {
    #[serde(rename = "mID", with = "as_string")]
    pub merger: MergerIndex,
    #[serde(with = "as_string")]
    pub time: TimestampSecs,
    #[serde(rename = "hgt", with = "as_string")]
    pub height: Height,
    pub hash: BlockHash,
}

impl ResStatusMessage {
    pub fn new(merger: MergerIndex, time: TimestampSecs, tip: &ChainLink) -> Self {
        Self {
            merger,
            time,
            height: tip.height,
            hash: tip.hash,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReqCheckMessage {
    #[serde(with = "as_string")]
    pub sender: MergerIndex,
    #[serde(with = "as_string")]
    pub time: TimestampSecs,
    /// Requesting client, echoed back untouched.
    #[serde(rename = "dID", default)]
    pub requester: String,
    pub txid: TransactionId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResCheckMessage {
    #[serde(rename = "mID", with = "as_string")]
    pub merger: MergerIndex,
    #[serde(with = "as_string")]
    pub time: TimestampSecs,
    #[serde(rename = "blockID")]
    pub block_id: BlockId,
    pub proof: Vec<ProofNode>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(with = "as_string")]
    pub sender: MergerIndex,
    #[serde(with = "as_string")]
    pub time: TimestampSecs,
    #[serde(rename = "type", with = "as_string")]
    pub kind: u8,
    #[serde(default)]
    pub info: String,
}

/// Node side of the in-process transport.
pub struct NetworkEndpoint {
    pub inbound: mpsc::Receiver<InboundMessage>,
    pub outbound: mpsc::UnboundedSender<OutboundMessage>,
}

/// Transport side: feeds peer messages in and drains what the node sends.
pub struct TransportHandle {
    pub inbound: mpsc::Sender<InboundMessage>,
    pub outbound: mpsc::UnboundedReceiver<OutboundMessage>,
}

pub fn channel_pair() -> (NetworkEndpoint, TransportHandle) {
    let (inbound_sender, inbound_receiver) = mpsc::channel(INBOUND_BUFFER);
    let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel();
    (
        NetworkEndpoint {
            inbound: inbound_receiver,
            outbound: outbound_sender,
        },
        TransportHandle {
            inbound: inbound_sender,
            outbound: outbound_receiver,
        },
    )
}

/// Connects the transport handles of a local cluster; handle `i` belongs to merger `i`.
/// Runs until every node dropped its outbound sender.
pub fn route_local(handles: Vec<TransportHandle>) -> JoinHandle<()> {
    let (merged_sender, mut merged) = mpsc::unbounded_channel();
    let mut inbound = Vec::with_capacity(handles.len());
    for (index, handle) in handles.into_iter().enumerate() {
        inbound.push(handle.inbound);
        let merged_sender = merged_sender.clone();
        let mut outbound = handle.outbound;
        Handle::current().spawn(async move {
            while let Some(message) = outbound.recv().await {
                if merged_sender.send((index as MergerIndex, message)).is_err() {
                    break;
                }
            }
        });
    }
    drop(merged_sender);
    Handle::current().spawn(async move {
        while let Some((sender, message)) = merged.recv().await {
            let receivers: Vec<MergerIndex> = if message.is_broadcast() {
                (0..inbound.len() as MergerIndex)
                    .filter(|peer| *peer != sender)
                    .collect()
            } else {
                message.receivers.clone()
            };
            for receiver in receivers {
                let Some(peer) = inbound.get(receiver as usize) else {
                    tracing::warn!("Dropping {:?} for unknown merger {receiver}", message.kind);
                    continue;
                };
                let delivered = InboundMessage {
                    kind: message.kind,
                    sender,
                    body: message.body.clone(),
                };
                if peer.send(delivered).await.is_err() {
                    tracing::debug!("Merger {receiver} stopped receiving");
                }
            }
        }
    })
}
