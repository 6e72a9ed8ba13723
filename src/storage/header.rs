//! The store header, kept in two alternating copies on pages 0 and 1.
//!
//! A checkpoint writes the complete header to the slot *not* used by the
//! previous checkpoint and syncs; recovery reads both slots and trusts
//! the one with the higher sequence whose checksum verifies. A torn
//! header write therefore loses to the older intact copy.

use log::debug;

use crate::error::SmallError;
use crate::io::{get_u32, get_u64, put_u32, put_u64};
use crate::storage::page_store::PageStore;
use crate::types::{PageId, SmallResult};

/// "smallst1" in little-endian.
const MAGIC: u64 = 0x3174_736c_6c61_6d73;
const VERSION: u32 = 1;

pub const PM_STATE_LEN: usize = 140;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_PAGE_SIZE: usize = 12;
const OFF_SEQUENCE: usize = 16;
const OFF_REDO_POSITION: usize = 24;
const OFF_TXN_COUNTER: usize = 32;
const OFF_REGISTRY_ROOT: usize = 40;
const OFF_PM_STATE: usize = 48;
const OFF_LIVE_UNDO: usize = 188;
const OFF_CRC: usize = 196;

pub const HEADER_LEN: usize = OFF_CRC + 4;

#[derive(Clone)]
pub struct Header {
    pub checkpoint_sequence: u64,
    pub redo_log_position: u64,
    pub txn_id_counter: u64,
    pub registry_root_page_id: PageId,
    pub page_manager_state: [u8; PM_STATE_LEN],
    /// Page listing the undo log heads of transactions that were live at
    /// checkpoint time; `NO_PAGE` when there were none.
    pub live_undo_page_id: PageId,
}

impl Header {
    pub fn new() -> Self {
        Self {
            checkpoint_sequence: 0,
            redo_log_position: 0,
            txn_id_counter: 1,
            registry_root_page_id: 0,
            page_manager_state: [0u8; PM_STATE_LEN],
            live_undo_page_id: 0,
        }
    }

    pub fn encode(&self, page_size: u32, buf: &mut [u8]) {
        assert!(buf.len() >= HEADER_LEN);
        buf[..HEADER_LEN].fill(0);
        put_u64(buf, OFF_MAGIC, MAGIC);
        put_u32(buf, OFF_VERSION, VERSION);
        put_u32(buf, OFF_PAGE_SIZE, page_size);
        put_u64(buf, OFF_SEQUENCE, self.checkpoint_sequence);
        put_u64(buf, OFF_REDO_POSITION, self.redo_log_position);
        put_u64(buf, OFF_TXN_COUNTER, self.txn_id_counter);
        put_u64(buf, OFF_REGISTRY_ROOT, self.registry_root_page_id);
        buf[OFF_PM_STATE..OFF_PM_STATE + PM_STATE_LEN].copy_from_slice(&self.page_manager_state);
        put_u64(buf, OFF_LIVE_UNDO, self.live_undo_page_id);
        let crc = crc32c::crc32c(&buf[..OFF_CRC]);
        put_u32(buf, OFF_CRC, crc);
    }

    pub fn decode(buf: &[u8], expect_page_size: u32) -> Result<Self, SmallError> {
        if buf.len() < HEADER_LEN {
            return Err(SmallError::corrupt("header page too small"));
        }
        if get_u64(buf, OFF_MAGIC) != MAGIC {
            return Err(SmallError::corrupt("bad magic"));
        }
        let crc = crc32c::crc32c(&buf[..OFF_CRC]);
        if crc != get_u32(buf, OFF_CRC) {
            return Err(SmallError::corrupt("header checksum mismatch"));
        }
        if get_u32(buf, OFF_VERSION) != VERSION {
            return Err(SmallError::corrupt(&format!(
                "unsupported version: {}",
                get_u32(buf, OFF_VERSION)
            )));
        }
        let page_size = get_u32(buf, OFF_PAGE_SIZE);
        if page_size != expect_page_size {
            return Err(SmallError::corrupt(&format!(
                "page size mismatch: file has {}, configured {}",
                page_size, expect_page_size
            )));
        }
        let mut page_manager_state = [0u8; PM_STATE_LEN];
        page_manager_state.copy_from_slice(&buf[OFF_PM_STATE..OFF_PM_STATE + PM_STATE_LEN]);
        Ok(Self {
            checkpoint_sequence: get_u64(buf, OFF_SEQUENCE),
            redo_log_position: get_u64(buf, OFF_REDO_POSITION),
            txn_id_counter: get_u64(buf, OFF_TXN_COUNTER),
            registry_root_page_id: get_u64(buf, OFF_REGISTRY_ROOT),
            page_manager_state,
            live_undo_page_id: get_u64(buf, OFF_LIVE_UNDO),
        })
    }

    /// Write this header to the slot opposite the given previous slot and
    /// sync. Returns the slot written.
    pub fn commit(&self, store: &dyn PageStore, previous_slot: PageId) -> Result<PageId, SmallError> {
        let slot = 1 - previous_slot;
        let mut buf = vec![0u8; store.page_size()];
        self.encode(store.page_size() as u32, &mut buf);
        store.write_page(slot, &buf)?;
        store.sync()?;
        debug!(
            "header committed, slot: {}, sequence: {}",
            slot, self.checkpoint_sequence
        );
        Ok(slot)
    }

    /// Read both header slots and return the newest valid one along with
    /// its slot number. Errors only when neither slot is usable.
    pub fn read_newest(
        store: &dyn PageStore,
        page_size: u32,
    ) -> Result<(Self, PageId), SmallError> {
        let mut best: Option<(Self, PageId)> = None;
        let mut buf = vec![0u8; store.page_size()];
        for slot in 0..2u64 {
            if slot >= store.page_count() {
                continue;
            }
            store.read_page(slot, &mut buf)?;
            match Self::decode(&buf, page_size) {
                Ok(header) => {
                    let newer = match &best {
                        Some((b, _)) => header.checkpoint_sequence > b.checkpoint_sequence,
                        None => true,
                    };
                    if newer {
                        best = Some((header, slot));
                    }
                }
                Err(e) => {
                    debug!("header slot {} rejected: {}", slot, e);
                }
            }
        }
        best.ok_or_else(|| SmallError::corrupt("no valid header found"))
    }

    /// Set up a brand new store: both header slots hold the initial
    /// header so either one recovers an empty engine.
    pub fn format(store: &dyn PageStore, page_size: u32, initial: &Header) -> SmallResult {
        let mut buf = vec![0u8; store.page_size()];
        initial.encode(page_size, &mut buf);
        store.write_page(0, &buf)?;
        store.write_page(1, &buf)?;
        store.sync()?;
        Ok(())
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}
