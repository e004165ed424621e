use actix_web::{error::BlockingError, http::StatusCode, web, HttpResponse, Responder};
use log::error;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::blockchain::{Address, Block, BlockError, ErrorClass, SledStore, Transaction};
use crate::node::{Node, NodeError};

/// Shared node state
pub type NodeData = web::Data<Node<SledStore>>;

/// Error body returned by every endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Response for the submit transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionResponse {
    pub message: String,

    /// Position of the block mined because this transaction filled it
    pub mined_block: Option<u64>,
}

/// Response for the add block endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct BlockResponse {
    pub message: String,

    /// Position the block was appended at
    pub index: u64,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct LastHashResponse {
    /// Base64 content hash of the most recent block
    pub hash: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    pub address: String,
    pub balance: u64,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct AbortResponse {
    pub message: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct SizeResponse {
    /// Number of blocks, genesis included
    pub size: u64,
}

fn error_body(status: StatusCode, message: String) -> HttpResponse {
    HttpResponse::build(status).json(ErrorResponse { error: message })
}

/// Maps a node failure onto an HTTP status
fn status_of(err: &NodeError) -> StatusCode {
    let class = match err {
        NodeError::Invalid(err) | NodeError::Block(BlockError::Invalid(err)) => err.class(),
        NodeError::Transaction(_) => ErrorClass::Cryptographic,
        NodeError::Replayed(_) | NodeError::UnexpectedReward => ErrorClass::MalformedInput,
        NodeError::Block(BlockError::InsufficientFunds { .. })
        | NodeError::Block(BlockError::InvalidFee { .. })
        | NodeError::Block(BlockError::BalanceOverflow(_)) => ErrorClass::Economic,
        NodeError::Block(BlockError::ZeroValue)
        | NodeError::Block(BlockError::NonceLength { .. })
        | NodeError::Block(BlockError::BlockFull(_)) => ErrorClass::MalformedInput,
        NodeError::Block(BlockError::MiningCancelled(_)) => ErrorClass::Linkage,
        NodeError::Block(_) | NodeError::Chain(_) | NodeError::LockPoisoned => ErrorClass::Io,
    };

    match class {
        ErrorClass::MalformedInput | ErrorClass::Cryptographic => StatusCode::BAD_REQUEST,
        ErrorClass::Economic => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorClass::Linkage => StatusCode::CONFLICT,
        ErrorClass::Io => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(err: NodeError) -> HttpResponse {
    let status = status_of(&err);
    if status.is_server_error() {
        error!("Node failure: {}", err);
    }
    error_body(status, err.to_string())
}

fn blocking_failure(err: BlockingError) -> HttpResponse {
    error!("Blocking task failed: {}", err);
    error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

/// Submit an externally mined block
///
/// Validates the block against the chain and appends it. A valid block
/// preempts mining in progress on this node; the transfers it was mining are
/// queued again on top of the new block.
#[utoipa::path(
    post,
    path = "/api/v1/blocks",
    request_body = Block,
    responses(
        (status = 201, description = "Block appended", body = BlockResponse),
        (status = 400, description = "Malformed or tampered block", body = ErrorResponse),
        (status = 409, description = "Block does not extend the current head", body = ErrorResponse),
        (status = 422, description = "Balances do not reconcile", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn add_block(node: NodeData, block: web::Json<Block>) -> impl Responder {
    let block = block.into_inner();
    match web::block(move || node.add_block(block)).await {
        Ok(Ok(index)) => HttpResponse::Created().json(BlockResponse {
            message: "Block appended".to_string(),
            index,
        }),
        Ok(Err(err)) => failure(err),
        Err(err) => blocking_failure(err),
    }
}

/// Submit a signed transaction
///
/// Adds the transaction to the block this node is filling. When the block
/// is full it is mined and appended before the response is sent.
#[utoipa::path(
    post,
    path = "/api/v1/transactions",
    request_body = Transaction,
    responses(
        (status = 202, description = "Transaction accepted", body = TransactionResponse),
        (status = 400, description = "Malformed, forged or replayed transaction", body = ErrorResponse),
        (status = 422, description = "Insufficient funds or wrong fee", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn submit_transaction(node: NodeData, tx: web::Json<Transaction>) -> impl Responder {
    let tx = tx.into_inner();
    match web::block(move || node.submit_transaction(tx)).await {
        Ok(Ok(mined_block)) => HttpResponse::Accepted().json(TransactionResponse {
            message: match mined_block {
                Some(_) => "Transaction included in a new block".to_string(),
                None => "Transaction queued".to_string(),
            },
            mined_block,
        }),
        Ok(Err(err)) => failure(err),
        Err(err) => blocking_failure(err),
    }
}

/// Get the block at a position
#[utoipa::path(
    get,
    path = "/api/v1/blocks/{index}",
    params(
        ("index" = u64, Path, description = "Block position, genesis is 0")
    ),
    responses(
        (status = 200, description = "Block found", body = Block),
        (status = 404, description = "No block at this position", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_block(node: NodeData, index: web::Path<u64>) -> impl Responder {
    let index = index.into_inner();
    match web::block(move || node.block_at(index)).await {
        Ok(Ok(Some(block))) => HttpResponse::Ok().json(block),
        Ok(Ok(None)) => error_body(StatusCode::NOT_FOUND, format!("No block at position {}", index)),
        Ok(Err(err)) => failure(err),
        Err(err) => blocking_failure(err),
    }
}

/// Get the hash of the most recent block
#[utoipa::path(
    get,
    path = "/api/v1/chain/last-hash",
    responses(
        (status = 200, description = "Last block hash", body = LastHashResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_last_hash(node: NodeData) -> impl Responder {
    match web::block(move || node.last_hash()).await {
        Ok(Ok(hash)) => HttpResponse::Ok().json(LastHashResponse {
            hash: hash.to_base64(),
        }),
        Ok(Err(err)) => failure(err),
        Err(err) => blocking_failure(err),
    }
}

/// Get the balance of an address
///
/// Balance as of the most recent block that mentions the address.
#[utoipa::path(
    get,
    path = "/api/v1/balance/{address}",
    params(
        ("address" = String, Path, description = "Base58 address or STORAGE-CHAIN")
    ),
    responses(
        (status = 200, description = "Balance retrieved", body = BalanceResponse),
        (status = 400, description = "Invalid address", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_balance(node: NodeData, address: web::Path<String>) -> impl Responder {
    let address: Address = match address.parse() {
        Ok(address) => address,
        Err(err) => return error_body(StatusCode::BAD_REQUEST, format!("Invalid address: {}", err)),
    };

    let lookup = address.clone();
    match web::block(move || node.balance(&lookup)).await {
        Ok(Ok(balance)) => HttpResponse::Ok().json(BalanceResponse {
            address: address.0,
            balance,
        }),
        Ok(Err(err)) => failure(err),
        Err(err) => blocking_failure(err),
    }
}

/// Get the number of blocks in the chain
#[utoipa::path(
    get,
    path = "/api/v1/chain/size",
    responses(
        (status = 200, description = "Chain size", body = SizeResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_size(node: NodeData) -> impl Responder {
    match web::block(move || node.size()).await {
        Ok(Ok(size)) => HttpResponse::Ok().json(SizeResponse { size }),
        Ok(Err(err)) => failure(err),
        Err(err) => blocking_failure(err),
    }
}

/// Abort mining
///
/// Cancels the proof-of-work search in flight, or the next one when the node
/// is idle. The transfers of the cancelled block are dropped.
#[utoipa::path(
    post,
    path = "/api/v1/mining/abort",
    responses(
        (status = 202, description = "Abort requested", body = AbortResponse)
    )
)]
pub async fn abort_mining(node: NodeData) -> impl Responder {
    node.abort_mining();
    HttpResponse::Accepted().json(AbortResponse {
        message: "Mining abort requested".to_string(),
    })
}
