use std::{
    io,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, ReadOptions, WriteOptions, DB};

use crate::{
    block_store::{BackupStore, ChainStore, TransactionProof},
    types::{Block, BlockReference, ChainLink, Height, TransactionId},
};

// Column families for different types of data
const CF_BLOCKS: &str = "blocks";
const CF_TRANSACTIONS: &str = "transactions";
const CF_BACKUP: &str = "backup";

const SEQUENCE_SIZE: usize = 8;

fn other<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::Other, e)
}

/// RocksDB backed chain and backup store.
///
/// Finalized blocks are keyed by big endian height so iteration follows the chain. Backup values
/// carry the sequence number of their first save ahead of the block bytes.
#[derive(Clone)]
pub struct RocksStore {
    db: Arc<DB>,
    write_opts: Arc<WriteOptions>,
    next_sequence: Arc<AtomicU64>,
}

impl RocksStore {
    fn get_read_opts() -> ReadOptions {
        ReadOptions::default()
    }

    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_background_jobs(4);
        opts.set_level_compaction_dynamic_level_bytes(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(64 * 1024 * 1024);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_BLOCKS, cf_opts.clone()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, cf_opts.clone()),
            ColumnFamilyDescriptor::new(CF_BACKUP, cf_opts),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors).map_err(other)?;

        let mut write_opts = WriteOptions::default();
        // Finalized blocks must survive a crash.
        write_opts.set_sync(true);

        let store = Self {
            db: Arc::new(db),
            write_opts: Arc::new(write_opts),
            next_sequence: Arc::new(AtomicU64::new(0)),
        };
        let last_sequence = store
            .backup_entries()?
            .into_iter()
            .map(|(sequence, _)| sequence)
            .max()
            .unwrap_or_default();
        store.next_sequence.store(last_sequence + 1, Ordering::Relaxed);
        Ok(store)
    }

    fn cf(&self, name: &str) -> io::Result<Arc<rocksdb::BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| other(format!("Column family {name} not found")))
    }

    fn decode_height(bytes: &[u8]) -> io::Result<Height> {
        let bytes: [u8; 8] = bytes
            .try_into()
            .map_err(|_| other("Malformed height key"))?;
        Ok(Height::from_be_bytes(bytes))
    }

    fn decode_block(bytes: &[u8]) -> io::Result<Block> {
        Block::deserialize(bytes).map_err(other)
    }

    fn backup_entries(&self) -> io::Result<Vec<(u64, BlockReference)>> {
        let cf_backup = self.cf(CF_BACKUP)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(&cf_backup, IteratorMode::Start) {
            let (key, value) = item.map_err(other)?;
            let Some(reference) = BlockReference::from_key(&key) else {
                tracing::warn!("Skipping malformed backup key {}", hex::encode(&key));
                continue;
            };
            if value.len() < SEQUENCE_SIZE {
                tracing::warn!("Skipping truncated backup entry {reference:?}");
                continue;
            }
            let sequence = u64::from_be_bytes(
                value[..SEQUENCE_SIZE]
                    .try_into()
                    .map_err(|_| other("Malformed backup sequence"))?,
            );
            entries.push((sequence, reference));
        }
        Ok(entries)
    }

    fn backup_value(&self, reference: &BlockReference) -> io::Result<Option<Vec<u8>>> {
        let cf_backup = self.cf(CF_BACKUP)?;
        self.db
            .get_cf_opt(&cf_backup, reference.to_key(), &Self::get_read_opts())
            .map_err(other)
    }
}

impl ChainStore for RocksStore {
    fn save_block(&self, block: &Block) -> io::Result<()> {
        let cf_blocks = self.cf(CF_BLOCKS)?;
        let cf_transactions = self.cf(CF_TRANSACTIONS)?;
        let height = block.height().to_be_bytes();
        let serialized = block.serialize().map_err(other)?;

        let mut batch = rocksdb::WriteBatch::default();
        batch.put_cf(&cf_blocks, height, serialized);
        for txid in block.tx_ids() {
            batch.put_cf(&cf_transactions, txid.as_ref(), height);
        }
        self.db
            .write_opt(batch, &self.write_opts)
            .map_err(other)
    }

    fn read_block(&self, height: Height) -> io::Result<Option<Block>> {
        let cf_blocks = self.cf(CF_BLOCKS)?;
        if height == 0 {
            return match self.db.iterator_cf(&cf_blocks, IteratorMode::End).next() {
                Some(item) => {
                    let (_, value) = item.map_err(other)?;
                    Self::decode_block(&value).map(Some)
                }
                None => Ok(None),
            };
        }
        self.db
            .get_cf_opt(&cf_blocks, height.to_be_bytes(), &Self::get_read_opts())
            .map_err(other)?
            .map(|value| Self::decode_block(&value))
            .transpose()
    }

    fn latest_link(&self) -> io::Result<Option<ChainLink>> {
        Ok(self.read_block(0)?.map(|block| block.link()))
    }

    fn transaction_proof(&self, txid: &TransactionId) -> io::Result<Option<TransactionProof>> {
        let cf_transactions = self.cf(CF_TRANSACTIONS)?;
        let Some(height) = self
            .db
            .get_cf_opt(&cf_transactions, txid.as_ref(), &Self::get_read_opts())
            .map_err(other)?
        else {
            return Ok(None);
        };
        let height = Self::decode_height(&height)?;
        Ok(self
            .read_block(height)?
            .and_then(|block| TransactionProof::for_transaction(&block, txid)))
    }
}

impl BackupStore for RocksStore {
    fn save(&self, reference: &BlockReference, serialized: &[u8]) -> io::Result<()> {
        let sequence = match self.backup_value(reference)? {
            Some(existing) if existing.len() >= SEQUENCE_SIZE => existing[..SEQUENCE_SIZE].to_vec(),
            _ => self
                .next_sequence
                .fetch_add(1, Ordering::Relaxed)
                .to_be_bytes()
                .to_vec(),
        };
        let mut value = sequence;
        value.extend_from_slice(serialized);
        let cf_backup = self.cf(CF_BACKUP)?;
        self.db
            .put_cf_opt(&cf_backup, reference.to_key(), value, &self.write_opts)
            .map_err(other)
    }

    fn read(&self, reference: &BlockReference) -> io::Result<Option<Vec<u8>>> {
        Ok(self
            .backup_value(reference)?
            .filter(|value| value.len() >= SEQUENCE_SIZE)
            .map(|value| value[SEQUENCE_SIZE..].to_vec()))
    }

    fn list_ids(&self) -> io::Result<Vec<BlockReference>> {
        let mut entries = self.backup_entries()?;
        entries.sort_unstable();
        Ok(entries.into_iter().map(|(_, reference)| reference).collect())
    }

    fn delete(&self, reference: &BlockReference) -> io::Result<()> {
        let cf_backup = self.cf(CF_BACKUP)?;
        self.db
            .delete_cf_opt(&cf_backup, reference.to_key(), &self.write_opts)
            .map_err(other)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        block_pool::{PoolParameters, UnresolvedBlockPool},
        crypto::verify_merkle_proof,
        test_util::TestChain,
    };

    #[test]
    fn finalized_blocks_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let chain = TestChain::new()
            .with_transactions(3)
            .draw("B1<-G:1; B2<-B1:2");
        {
            let store = RocksStore::open(dir.path()).unwrap();
            assert_eq!(store.latest_link().unwrap(), None);
            for block in chain.blocks("B1 B2") {
                store.save_block(&block).unwrap();
            }
        }
        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.latest_link().unwrap(), Some(chain.link("B2")));
        assert_eq!(store.read_block(1).unwrap().as_ref(), Some(chain.block("B1")));
        assert_eq!(store.read_block(0).unwrap().as_ref(), Some(chain.block("B2")));
        assert_eq!(store.read_block(3).unwrap(), None);

        let block = chain.block("B1");
        let txid = block.tx_ids()[2];
        let proof = store.transaction_proof(&txid).unwrap().unwrap();
        assert_eq!(proof.block_id, block.id());
        assert!(verify_merkle_proof(&txid, &proof.proof, &block.header().tx_root));
    }

    #[test]
    fn backup_lists_in_first_save_order_across_reopen() {
        let dir = TempDir::new().unwrap();
        let chain = TestChain::new().draw("B1<-G:1; B2<-B1:1; B3<-B2:1");
        let (b1, b2, b3) = (
            chain.block("B1").reference(),
            chain.block("B2").reference(),
            chain.block("B3").reference(),
        );
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store.save(&b3, b"three").unwrap();
            store.save(&b1, b"one").unwrap();
            store.save(&b3, b"three again").unwrap();
        }
        let store = RocksStore::open(dir.path()).unwrap();
        store.save(&b2, b"two").unwrap();
        assert_eq!(store.list_ids().unwrap(), vec![b3, b1, b2]);
        assert_eq!(store.read(&b3).unwrap(), Some(b"three again".to_vec()));
        store.delete(&b1).unwrap();
        assert_eq!(store.read(&b1).unwrap(), None);
        assert_eq!(store.list_ids().unwrap(), vec![b3, b2]);
    }

    #[test]
    fn pool_restores_from_rocks_backup() {
        let dir = TempDir::new().unwrap();
        let chain = TestChain::new()
            .with_tip("B10", 10)
            .draw("B11<-B10:1; B12a<-B11:0; B12b<-B11:1; B13<-B12b:0");
        let parameters = PoolParameters {
            block_confirm_level: 3,
            block_interval: std::time::Duration::ZERO,
            max_bins: 64,
        };
        let (link, layer) = {
            let store = Arc::new(RocksStore::open(dir.path()).unwrap());
            let mut pool = UnresolvedBlockPool::new(chain.link("B10"), parameters.clone(), store);
            for block in chain.blocks("B13 B12a B11 B12b") {
                pool.push(block, false);
            }
            (
                pool.get_most_possible_link(),
                pool.get_most_possible_block_layer(),
            )
        };
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let mut pool = UnresolvedBlockPool::new(chain.link("B10"), parameters, store);
        assert_eq!(pool.restore_pool().restored, 4);
        assert_eq!(pool.get_most_possible_link(), link);
        assert_eq!(pool.get_most_possible_block_layer(), layer);
        assert_eq!(link, chain.link("B13"));
    }
}
