//! Turns raw `eth_getLogs` JSON into typed events. Nothing past this module
//! sees untyped RPC data.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::core::{Market, SwapEvent, TransferEvent};

/// keccak256("Swap(address,uint256,uint256,uint256,uint256,address)")
pub const SWAP_TOPIC: &str = "0xd78ad95fa46c994b6551d0da85fc275fe613ce37657fb8d5e3d130840159d822";

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Maps block numbers to times when logs carry no `blockTimestamp`.
#[derive(Debug, Clone, Copy)]
pub struct BlockClock {
    head_block: u64,
    head_time: i64,
    block_time_secs: u64,
}

impl BlockClock {
    pub fn new(head_block: u64, head_time: i64, block_time_secs: u64) -> Self {
        Self {
            head_block,
            head_time,
            block_time_secs,
        }
    }

    pub fn estimate(&self, block: u64) -> i64 {
        let behind = self.head_block.saturating_sub(block) as i64;
        self.head_time - behind * self.block_time_secs as i64
    }
}

pub fn to_hex(n: u64) -> String {
    format!("{n:#x}")
}

pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x")?;
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// A 32-byte ABI word as u128. `None` if it doesn't fit.
pub fn parse_word_u128(word: &str) -> Option<u128> {
    if word.len() != 64 || !word.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let (high, low) = word.split_at(32);
    if high.chars().any(|c| c != '0') {
        return None;
    }
    u128::from_str_radix(low, 16).ok()
}

/// Split ABI data into 32-byte words.
pub fn data_words(data: &str) -> Option<Vec<&str>> {
    let hex = data.strip_prefix("0x")?;
    if hex.len() % 64 != 0 {
        return None;
    }
    Some((0..hex.len() / 64).map(|i| &hex[i * 64..(i + 1) * 64]).collect())
}

/// Indexed address topic → `0x`-prefixed lowercase address.
pub fn topic_to_address(topic: &str) -> Option<String> {
    let hex = topic.strip_prefix("0x")?;
    if hex.len() != 64 {
        return None;
    }
    Some(format!("0x{}", hex[24..].to_ascii_lowercase()))
}

pub fn address_to_topic(address: &str) -> String {
    let hex = address.trim_start_matches("0x").to_ascii_lowercase();
    format!("0x{hex:0>64}")
}

fn field_u64(log: &Value, key: &str) -> Option<u64> {
    log.get(key).and_then(Value::as_str).and_then(parse_hex_u64)
}

fn topic(log: &Value, idx: usize) -> Option<&str> {
    log.get("topics")?.get(idx)?.as_str()
}

fn is_removed(log: &Value) -> bool {
    log.get("removed").and_then(Value::as_bool).unwrap_or(false)
}

/// Decode a V2 `Swap` log for `market`. `None` for anything malformed or
/// reorged out.
pub fn decode_swap(log: &Value, market: &Market, clock: &BlockClock) -> Option<SwapEvent> {
    if is_removed(log) || !topic(log, 0)?.eq_ignore_ascii_case(SWAP_TOPIC) {
        return None;
    }
    let block_number = field_u64(log, "blockNumber")?;
    let log_index = field_u64(log, "logIndex")?;
    let tx_hash = log.get("transactionHash")?.as_str()?.to_string();
    let sender = topic_to_address(topic(log, 1)?)?;
    let recipient = topic_to_address(topic(log, 2)?)?;

    let words = data_words(log.get("data")?.as_str()?)?;
    if words.len() != 4 {
        return None;
    }
    let amounts: Vec<u128> = words.iter().map(|w| parse_word_u128(w)).collect::<Option<_>>()?;
    let (amount0_in, amount1_in, amount0_out, amount1_out) = (amounts[0], amounts[1], amounts[2], amounts[3]);

    let (base_in, quote_in, base_out, quote_out) = if market.base_token_index == 0 {
        (amount0_in, amount1_in, amount0_out, amount1_out)
    } else {
        (amount1_in, amount0_in, amount1_out, amount0_out)
    };
    let (token_in_is_base, amount_in, amount_out) = if base_in > 0 {
        (true, base_in, quote_out)
    } else {
        (false, quote_in, base_out)
    };

    let seconds = match field_u64(log, "blockTimestamp") {
        Some(t) => t as i64,
        None => clock.estimate(block_number),
    };

    Some(SwapEvent {
        market_id: market.id.clone(),
        block_number,
        log_index,
        tx_hash,
        timestamp: DateTime::<Utc>::from_timestamp(seconds, 0)?,
        sender,
        recipient,
        amount_in,
        amount_out,
        token_in_is_base,
    })
}

/// Decode an ERC-20 `Transfer` log.
pub fn decode_transfer(log: &Value) -> Option<TransferEvent> {
    if is_removed(log) || !topic(log, 0)?.eq_ignore_ascii_case(TRANSFER_TOPIC) {
        return None;
    }
    let words = data_words(log.get("data")?.as_str()?)?;
    Some(TransferEvent {
        block_number: field_u64(log, "blockNumber")?,
        log_index: field_u64(log, "logIndex")?,
        from: topic_to_address(topic(log, 1)?)?,
        to: topic_to_address(topic(log, 2)?)?,
        amount: parse_word_u128(words.first()?)?,
    })
}

/// `getReserves()` return data → reserve0 + reserve1. Zero reserves count as
/// unknown.
pub fn decode_reserves(data: &str) -> Option<f64> {
    let words = data_words(data)?;
    if words.len() < 2 {
        return None;
    }
    let total = parse_word_u128(words[0])? as f64 + parse_word_u128(words[1])? as f64;
    (total > 0.0).then_some(total)
}
