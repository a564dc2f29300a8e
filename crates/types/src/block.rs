//! Raw-block preprocessing.
//!
//! The sync pipeline downloads whole raw blocks but persists only headers;
//! the rest of the block is walked once to extract the light projection the
//! controller and the stats surface consume: per-transaction ids and the
//! input/output enumerations. Parsing covers the legacy Bitcoin-family
//! transaction layout (no witness data).

use std::fmt;
use std::mem;

use crate::hash::{sha256d, Txid, HASH_SIZE};
use crate::{Error, Result};

/// Serialized size of a block header in bytes.
pub const HEADER_SIZE: usize = 80;

/// A raw serialized block header.
pub type RawHeader = [u8; HEADER_SIZE];

/// The previous-block hash field of a header, in internal (wire) byte order.
pub fn prev_block_hash(header: &RawHeader) -> [u8; HASH_SIZE] {
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(&header[4..36]);
    out
}

/// The double-SHA-256 of a header, in internal (wire) byte order.
pub fn header_hash(header: &RawHeader) -> [u8; HASH_SIZE] {
    sha256d(header)
}

/// Summary of one parsed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInfo {
    /// Transaction id (display order).
    pub txid: Txid,
    /// Number of inputs.
    pub n_inputs: u32,
    /// Number of outputs.
    pub n_outputs: u32,
}

/// One spent input, positioned by transaction and input index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputRef {
    /// Index of the spending transaction within the block.
    pub tx_idx: u32,
    /// Input index within that transaction.
    pub vin: u32,
}

/// One created output, positioned by transaction and output index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputRef {
    /// Index of the creating transaction within the block.
    pub tx_idx: u32,
    /// Output index within that transaction.
    pub vout: u32,
    /// Output value in satoshis.
    pub value_sats: u64,
}

/// A block reduced to what the sync pipeline needs.
#[derive(Debug, Clone)]
pub struct PreProcessedBlock {
    /// Block height this block was downloaded for.
    pub height: u32,
    /// Serialized size of the full raw block.
    pub size_bytes: usize,
    /// The raw 80-byte header.
    pub header: RawHeader,
    /// Per-transaction summaries, in block order.
    pub tx_infos: Vec<TxInfo>,
    /// All inputs spent by this block.
    pub inputs: Vec<InputRef>,
    /// All outputs created by this block.
    pub outputs: Vec<OutputRef>,
    /// Rough in-memory footprint of this structure.
    pub estimated_mem_bytes: usize,
}

impl PreProcessedBlock {
    /// Walks a raw serialized block and extracts the light projection.
    ///
    /// The whole buffer must be consumed; trailing bytes are an error, as is
    /// any truncation mid-structure.
    pub fn preprocess(height: u32, raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_SIZE {
            return Err(Error::BadBlock(format!(
                "truncated header: {} bytes",
                raw.len()
            )));
        }
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&raw[..HEADER_SIZE]);

        let mut r = Reader::new(raw, HEADER_SIZE);
        let n_tx = r.read_compact_size()?;
        if n_tx == 0 || n_tx > r.remaining() as u64 {
            return Err(Error::BadBlock(format!("implausible tx count {n_tx}")));
        }

        let mut tx_infos = Vec::with_capacity(n_tx as usize);
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();

        for tx_idx in 0..n_tx as u32 {
            let tx_start = r.pos();
            r.skip(4)?; // version

            let n_in = r.read_compact_size()?;
            if n_in == 0 || n_in > r.remaining() as u64 {
                return Err(Error::BadBlock(format!(
                    "tx {tx_idx}: implausible input count {n_in}"
                )));
            }
            for vin in 0..n_in as u32 {
                r.skip(36)?; // outpoint
                let script_len = r.read_compact_size()?;
                r.skip(script_len as usize)?;
                r.skip(4)?; // sequence
                inputs.push(InputRef { tx_idx, vin });
            }

            let n_out = r.read_compact_size()?;
            if n_out == 0 || n_out > r.remaining() as u64 {
                return Err(Error::BadBlock(format!(
                    "tx {tx_idx}: implausible output count {n_out}"
                )));
            }
            for vout in 0..n_out as u32 {
                let value_sats = r.read_u64_le()?;
                let script_len = r.read_compact_size()?;
                r.skip(script_len as usize)?;
                outputs.push(OutputRef {
                    tx_idx,
                    vout,
                    value_sats,
                });
            }

            r.skip(4)?; // locktime
            let txid = Txid::hash_rev(&raw[tx_start..r.pos()]);
            tx_infos.push(TxInfo {
                txid,
                n_inputs: n_in as u32,
                n_outputs: n_out as u32,
            });
        }

        if r.remaining() != 0 {
            return Err(Error::BadBlock(format!(
                "{} trailing bytes after last tx",
                r.remaining()
            )));
        }

        let estimated_mem_bytes = mem::size_of::<Self>()
            + tx_infos.len() * mem::size_of::<TxInfo>()
            + inputs.len() * mem::size_of::<InputRef>()
            + outputs.len() * mem::size_of::<OutputRef>();

        Ok(Self {
            height,
            size_bytes: raw.len(),
            header,
            tx_infos,
            inputs,
            outputs,
            estimated_mem_bytes,
        })
    }
}

impl fmt::Display for PreProcessedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(block height: {} size: {} nTx: {} nIns: {} nOuts: {})",
            self.height,
            self.size_bytes,
            self.tx_infos.len(),
            self.inputs.len(),
            self.outputs.len()
        )
    }
}

/// Bounds-checked cursor over a raw block buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::BadBlock(format!(
                "truncated at offset {}: wanted {n} bytes, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8 bytes")))
    }

    /// Reads a Bitcoin CompactSize varint.
    fn read_compact_size(&mut self) -> Result<u64> {
        let tag = self.take(1)?[0];
        match tag {
            0xfd => {
                let b = self.take(2)?;
                Ok(u16::from_le_bytes(b.try_into().expect("2 bytes")) as u64)
            }
            0xfe => {
                let b = self.take(4)?;
                Ok(u32::from_le_bytes(b.try_into().expect("4 bytes")) as u64)
            }
            0xff => {
                let b = self.take(8)?;
                Ok(u64::from_le_bytes(b.try_into().expect("8 bytes")))
            }
            n => Ok(n as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal legacy tx: one input, `n_out` outputs of 50 sats each.
    pub(crate) fn make_tx(n_out: u8) -> Vec<u8> {
        let mut tx = Vec::new();
        tx.extend_from_slice(&1u32.to_le_bytes()); // version
        tx.push(1); // one input
        tx.extend_from_slice(&[0u8; 36]); // outpoint
        tx.push(0); // empty script
        tx.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // sequence
        tx.push(n_out);
        for _ in 0..n_out {
            tx.extend_from_slice(&50u64.to_le_bytes());
            tx.push(1); // 1-byte script
            tx.push(0x51); // OP_1
        }
        tx.extend_from_slice(&0u32.to_le_bytes()); // locktime
        tx
    }

    pub(crate) fn make_block(txs: &[Vec<u8>]) -> Vec<u8> {
        let mut raw = vec![0u8; HEADER_SIZE];
        raw[0] = 1; // version
        assert!(txs.len() < 0xfd);
        raw.push(txs.len() as u8);
        for tx in txs {
            raw.extend_from_slice(tx);
        }
        raw
    }

    #[test]
    fn preprocess_counts_txs_inputs_outputs() {
        let txs = vec![make_tx(1), make_tx(2), make_tx(3)];
        let raw = make_block(&txs);
        let ppb = PreProcessedBlock::preprocess(7, &raw).unwrap();

        assert_eq!(ppb.height, 7);
        assert_eq!(ppb.size_bytes, raw.len());
        assert_eq!(ppb.tx_infos.len(), 3);
        assert_eq!(ppb.inputs.len(), 3);
        assert_eq!(ppb.outputs.len(), 6);
        assert_eq!(ppb.outputs[0].value_sats, 50);
        assert_eq!(ppb.tx_infos[1].txid, Txid::hash_rev(&txs[1]));
        assert!(ppb.estimated_mem_bytes > 0);
    }

    #[test]
    fn preprocess_rejects_truncation() {
        let raw = make_block(&[make_tx(1)]);
        for cut in [10, HEADER_SIZE, raw.len() - 1] {
            assert!(matches!(
                PreProcessedBlock::preprocess(0, &raw[..cut]),
                Err(Error::BadBlock(_))
            ));
        }
    }

    #[test]
    fn preprocess_rejects_trailing_bytes() {
        let mut raw = make_block(&[make_tx(1)]);
        raw.push(0);
        assert!(matches!(
            PreProcessedBlock::preprocess(0, &raw),
            Err(Error::BadBlock(_))
        ));
    }

    #[test]
    fn prev_hash_field_is_extracted() {
        let mut header = [0u8; HEADER_SIZE];
        header[4..36].copy_from_slice(&[0xabu8; 32]);
        assert_eq!(prev_block_hash(&header), [0xabu8; 32]);
    }
}
