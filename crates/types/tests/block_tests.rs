//! Raw-block preprocessing against hand-built blocks.

use ember_types::{BlockHash, Error, PreProcessedBlock, Txid, HEADER_SIZE};

fn tx_with(n_in: u8, n_out: u8) -> Vec<u8> {
    let mut tx = Vec::new();
    tx.extend_from_slice(&2u32.to_le_bytes());
    tx.push(n_in);
    for i in 0..n_in {
        let mut outpoint = [0u8; 36];
        outpoint[0] = i;
        tx.extend_from_slice(&outpoint);
        tx.push(2); // 2-byte script
        tx.extend_from_slice(&[0x51, 0x52]);
        tx.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
    }
    tx.push(n_out);
    for i in 0..n_out {
        tx.extend_from_slice(&(1_000u64 * (i as u64 + 1)).to_le_bytes());
        tx.push(1);
        tx.push(0x51);
    }
    tx.extend_from_slice(&0u32.to_le_bytes());
    tx
}

fn block_with(txs: &[Vec<u8>]) -> Vec<u8> {
    let mut raw = vec![7u8; HEADER_SIZE];
    raw.push(txs.len() as u8);
    for tx in txs {
        raw.extend_from_slice(tx);
    }
    raw
}

#[test]
fn header_and_counts_survive_preprocessing() {
    let txs = vec![tx_with(1, 2), tx_with(3, 1)];
    let raw = block_with(&txs);
    let ppb = PreProcessedBlock::preprocess(500_000, &raw).unwrap();

    assert_eq!(ppb.height, 500_000);
    assert_eq!(&ppb.header[..], &raw[..HEADER_SIZE]);
    assert_eq!(ppb.size_bytes, raw.len());
    assert_eq!(ppb.tx_infos.len(), 2);
    assert_eq!(ppb.inputs.len(), 4);
    assert_eq!(ppb.outputs.len(), 3);

    assert_eq!(ppb.tx_infos[0].n_inputs, 1);
    assert_eq!(ppb.tx_infos[0].n_outputs, 2);
    assert_eq!(ppb.tx_infos[1].n_inputs, 3);
    assert_eq!(ppb.tx_infos[1].n_outputs, 1);

    // txids are the double-SHA of the tx bytes, display order
    assert_eq!(ppb.tx_infos[0].txid, Txid::hash_rev(&txs[0]));

    // outputs carry their values and positions
    assert_eq!(ppb.outputs[0].value_sats, 1_000);
    assert_eq!(ppb.outputs[1].value_sats, 2_000);
    assert_eq!(ppb.outputs[2].tx_idx, 1);
}

#[test]
fn header_hash_round_trip() {
    let raw = block_with(&[tx_with(1, 1)]);
    let ppb = PreProcessedBlock::preprocess(0, &raw).unwrap();
    // the header hashes to the same id whether taken from the block or
    // from the preprocessed copy
    assert_eq!(
        BlockHash::hash_rev(&ppb.header),
        BlockHash::hash_rev(&raw[..HEADER_SIZE])
    );
}

#[test]
fn empty_and_short_buffers_are_rejected() {
    assert!(matches!(
        PreProcessedBlock::preprocess(0, &[]),
        Err(Error::BadBlock(_))
    ));
    assert!(matches!(
        PreProcessedBlock::preprocess(0, &[0u8; HEADER_SIZE]),
        Err(Error::BadBlock(_))
    ));
}

#[test]
fn zero_tx_block_is_rejected() {
    let mut raw = vec![0u8; HEADER_SIZE];
    raw.push(0); // tx count 0
    assert!(matches!(
        PreProcessedBlock::preprocess(0, &raw),
        Err(Error::BadBlock(_))
    ));
}
