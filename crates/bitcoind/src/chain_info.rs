//! Typed view of `getblockchaininfo`.
//!
//! Required fields must parse or the whole record is rejected; advisory
//! fields default silently so a slightly different bitcoind fork does not
//! break the probe.

use serde_json::Value;
use std::fmt;

use ember_types::BlockHash;

use crate::error::RpcError;

/// The data bitcoind returns from the `getblockchaininfo` RPC method.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainInfo {
    /// Network name ("main", "test", ...). Required, non-empty.
    pub chain: String,
    /// Height of the fully-validated chain. Required, non-negative.
    pub blocks: i32,
    /// Best known header height. Advisory.
    pub headers: i32,
    /// Hash of the best block. Required, exactly hash width.
    pub best_block_hash: BlockHash,
    /// Current difficulty. Advisory.
    pub difficulty: f64,
    /// Median time past of the tip, seconds. Advisory.
    pub mtp: i64,
    /// Verification progress in [0, 1]. Advisory.
    pub verification_progress: f64,
    /// Whether the node is still in initial block download. Required.
    pub initial_block_download: bool,
    /// Total chain work, decoded bytes. Advisory.
    pub chain_work: Vec<u8>,
    /// Estimated on-disk size. Advisory.
    pub size_on_disk: u64,
    /// Whether the node is pruned. Advisory.
    pub pruned: bool,
    /// Any network or node warnings. Advisory.
    pub warnings: String,
}

impl ChainInfo {
    /// Parses a `getblockchaininfo` result object.
    pub fn from_value(value: &Value) -> Result<Self, RpcError> {
        let err = |thing: &str| RpcError::BadResponse(format!("failed to parse {thing}"));

        let map = value.as_object().ok_or_else(|| err("response; expected map"))?;

        let blocks = map
            .get("blocks")
            .and_then(Value::as_i64)
            .filter(|b| *b >= 0 && *b <= i32::MAX as i64)
            .ok_or_else(|| err("blocks"))? as i32;

        let chain = map
            .get("chain")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| err("chain"))?
            .to_owned();

        let best_block_hash = map
            .get("bestblockhash")
            .and_then(Value::as_str)
            .and_then(|s| BlockHash::from_hex(s).ok())
            .ok_or_else(|| err("bestblockhash"))?;

        let initial_block_download = map
            .get("initialblockdownload")
            .and_then(Value::as_bool)
            .ok_or_else(|| err("initialblockdownload"))?;

        Ok(Self {
            chain,
            blocks,
            headers: map.get("headers").and_then(Value::as_i64).unwrap_or(-1) as i32,
            best_block_hash,
            difficulty: map.get("difficulty").and_then(Value::as_f64).unwrap_or(0.0),
            mtp: map.get("mediantime").and_then(Value::as_i64).unwrap_or(0),
            verification_progress: map
                .get("verificationprogress")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            initial_block_download,
            chain_work: map
                .get("chainwork")
                .and_then(Value::as_str)
                .and_then(|s| hex::decode(s).ok())
                .unwrap_or_default(),
            size_on_disk: map.get("size_on_disk").and_then(Value::as_u64).unwrap_or(0),
            pruned: map.get("pruned").and_then(Value::as_bool).unwrap_or(false),
            warnings: warnings_text(map.get("warnings")),
        })
    }
}

// newer daemons return "warnings" as an array of strings
fn warnings_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("; "),
        _ => String::new(),
    }
}

impl fmt::Display for ChainInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(ChainInfo chain: \"{}\" blocks: {} headers: {} bestBlockHash: {} \
             difficulty: {:.9} mtp: {} verificationProgress: {:.6} ibd: {} \
             chainWork: {} sizeOnDisk: {} pruned: {} warnings: \"{}\")",
            self.chain,
            self.blocks,
            self.headers,
            self.best_block_hash,
            self.difficulty,
            self.mtp,
            self.verification_progress,
            self.initial_block_download,
            hex::encode(&self.chain_work),
            self.size_on_disk,
            self.pruned,
            self.warnings
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_reply() -> Value {
        json!({
            "chain": "main",
            "blocks": 123,
            "headers": 125,
            "bestblockhash": "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
            "difficulty": 21448277761059.71,
            "mediantime": 1700000000,
            "verificationprogress": 0.9999,
            "initialblockdownload": false,
            "chainwork": "00000000000000000000000000000000000000000000000000ff00ff00ff00ff",
            "size_on_disk": 554_000_000_000u64,
            "pruned": false,
            "warnings": ""
        })
    }

    #[test]
    fn parses_full_reply() {
        let info = ChainInfo::from_value(&full_reply()).unwrap();
        assert_eq!(info.chain, "main");
        assert_eq!(info.blocks, 123);
        assert_eq!(info.headers, 125);
        assert!(!info.initial_block_download);
        assert_eq!(info.chain_work.len(), 32);
        assert_eq!(info.mtp, 1700000000);
    }

    #[test]
    fn required_fields_hard_fail() {
        for (key, bad) in [
            ("blocks", json!(-1)),
            ("blocks", json!("nope")),
            ("chain", json!("")),
            ("bestblockhash", json!("abcd")),
            ("initialblockdownload", json!("yes")),
        ] {
            let mut reply = full_reply();
            reply[key] = bad;
            let err = ChainInfo::from_value(&reply).unwrap_err();
            assert!(
                matches!(&err, RpcError::BadResponse(msg) if msg.contains(key)),
                "{key}: {err}"
            );
        }
    }

    #[test]
    fn advisory_fields_default_silently() {
        let reply = json!({
            "chain": "test",
            "blocks": 0,
            "bestblockhash": "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
            "initialblockdownload": true,
            "headers": "garbage",
            "difficulty": "garbage",
            "chainwork": "zz-not-hex",
        });
        let info = ChainInfo::from_value(&reply).unwrap();
        assert_eq!(info.headers, -1);
        assert_eq!(info.difficulty, 0.0);
        assert!(info.chain_work.is_empty());
        assert_eq!(info.size_on_disk, 0);
        assert!(!info.pruned);
        assert_eq!(info.warnings, "");
        assert!(info.initial_block_download);
    }

    #[test]
    fn warnings_array_is_joined() {
        let mut reply = full_reply();
        reply["warnings"] = json!(["a", "b"]);
        let info = ChainInfo::from_value(&reply).unwrap();
        assert_eq!(info.warnings, "a; b");
    }

    #[test]
    fn display_is_loggable() {
        let info = ChainInfo::from_value(&full_reply()).unwrap();
        let s = info.to_string();
        assert!(s.contains("chain: \"main\""));
        assert!(s.contains("blocks: 123"));
    }
}
