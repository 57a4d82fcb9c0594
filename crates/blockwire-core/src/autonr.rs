//! Automatic device numbering.
//!
//! UI clients, games and other ad-hoc devices connect without a device
//! number: they send the `AUTO_DEVICE_NR` sentinel and the controller
//! assigns one. A client that presents a non-zero 16-byte unique id gets a
//! *stable* number out of a small persisted reservation table, so it keeps
//! its identity across reconnects and power cycles. Clients without a
//! unique id get the next monotonic number; if that space ever runs out,
//! random draw with a duplicate scan.

use crate::{
    env::Environment,
    persist::{BlobId, Persistent},
};

/// Device number sentinel: "assign me one".
pub const AUTO_DEVICE_NR: u32 = 10_000;

/// First stable number handed out from the reservation table.
const RESERVED_START: u32 = AUTO_DEVICE_NR + 1;
/// Last stable number in the reserved range.
const RESERVED_END: u32 = AUTO_DEVICE_NR + 998;
/// First number handed to clients without a unique id.
const MONOTONIC_START: u32 = 11_000;
/// Largest number ever assigned (mbinfo carries device numbers in at most
/// two bytes).
const MONOTONIC_END: u32 = 0xFFFF;

/// Reservation table capacity.
const TABLE_SLOTS: usize = 40;

const SLOT_BYTES: usize = 16 + 4 + 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Slot {
    unique_id: [u8; 16],
    device_nr: u32,
    issued_seq: u64,
}

impl Slot {
    fn occupied(&self) -> bool {
        self.device_nr != 0
    }
}

/// Automatic device-number state for one root.
pub(crate) struct AutoNumbers {
    slots: [Slot; TABLE_SLOTS],
    next_reserved: u32,
    next_seq: u64,
    next_monotonic: u32,
    loaded: bool,
}

impl Default for AutoNumbers {
    fn default() -> Self {
        Self {
            slots: [Slot::default(); TABLE_SLOTS],
            next_reserved: RESERVED_START,
            next_seq: 1,
            next_monotonic: MONOTONIC_START,
            loaded: false,
        }
    }
}

impl AutoNumbers {
    /// Assign a device number for a connecting client.
    ///
    /// `unique_id` of all zeros counts as absent. `in_use` lets the caller
    /// veto numbers already taken by live connections during random
    /// fallback.
    pub fn assign<E: Environment>(
        &mut self,
        unique_id: Option<[u8; 16]>,
        persist: Option<&mut (dyn Persistent + 'static)>,
        env: &E,
        in_use: impl Fn(u32) -> bool,
    ) -> u32 {
        if let Some(id) = unique_id.filter(|id| id.iter().any(|&b| b != 0)) {
            return self.assign_reserved(id, persist);
        }

        if self.next_monotonic <= MONOTONIC_END {
            let nr = self.next_monotonic;
            self.next_monotonic += 1;
            return nr;
        }

        // Exhausted; random draw with collision retry.
        for _ in 0..1000 {
            let nr = env.random_range(MONOTONIC_START, MONOTONIC_END);
            if !in_use(nr) && !self.slots.iter().any(|slot| slot.device_nr == nr) {
                return nr;
            }
        }
        tracing::warn!("device number space exhausted");
        1
    }

    fn assign_reserved(
        &mut self,
        unique_id: [u8; 16],
        mut persist: Option<&mut (dyn Persistent + 'static)>,
    ) -> u32 {
        if !self.loaded {
            if let Some(store) = persist.as_deref_mut() {
                self.load(store);
            }
            self.loaded = true;
        }

        // Already reserved for this hardware?
        let existing = self
            .slots
            .iter()
            .position(|slot| slot.occupied() && slot.unique_id == unique_id);
        if let Some(ix) = existing {
            self.slots[ix].issued_seq = self.next_seq;
            self.next_seq += 1;
            let nr = self.slots[ix].device_nr;
            if let Some(store) = persist.as_deref_mut() {
                self.save(store);
            }
            return nr;
        }

        if !(RESERVED_START..=RESERVED_END).contains(&self.next_reserved) {
            self.next_reserved = RESERVED_START;
        }
        let nr = self.next_reserved;
        self.next_reserved += 1;

        // Take a free slot, or reuse the least-recently-issued one.
        let slot_ix = self
            .slots
            .iter()
            .position(|slot| !slot.occupied())
            .unwrap_or_else(|| {
                let mut min_ix = 0;
                for (ix, slot) in self.slots.iter().enumerate() {
                    if slot.issued_seq < self.slots[min_ix].issued_seq {
                        min_ix = ix;
                    }
                }
                min_ix
            });
        self.slots[slot_ix] = Slot { unique_id, device_nr: nr, issued_seq: self.next_seq };
        self.next_seq += 1;

        if let Some(store) = persist.as_deref_mut() {
            self.save(store);
        }
        nr
    }

    fn load(&mut self, store: &mut (dyn Persistent + 'static)) {
        let Ok(Some(data)) = store.load(BlobId::AUTO_DEVICE_TABLE) else {
            return;
        };
        if data.len() < 12 {
            return;
        }
        self.next_reserved = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        self.next_seq =
            u64::from_le_bytes([data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11]]);
        for (ix, chunk) in data[12..].chunks_exact(SLOT_BYTES).take(TABLE_SLOTS).enumerate() {
            let mut unique_id = [0u8; 16];
            unique_id.copy_from_slice(&chunk[..16]);
            let device_nr = u32::from_le_bytes([chunk[16], chunk[17], chunk[18], chunk[19]]);
            let mut seq = [0u8; 8];
            seq.copy_from_slice(&chunk[20..28]);
            self.slots[ix] = Slot { unique_id, device_nr, issued_seq: u64::from_le_bytes(seq) };
        }
    }

    fn save(&self, store: &mut (dyn Persistent + 'static)) {
        let mut data = Vec::with_capacity(12 + TABLE_SLOTS * SLOT_BYTES);
        data.extend_from_slice(&self.next_reserved.to_le_bytes());
        data.extend_from_slice(&self.next_seq.to_le_bytes());
        for slot in &self.slots {
            data.extend_from_slice(&slot.unique_id);
            data.extend_from_slice(&slot.device_nr.to_le_bytes());
            data.extend_from_slice(&slot.issued_seq.to_le_bytes());
        }
        if let Err(err) = store.save(BlobId::AUTO_DEVICE_TABLE, &data, false) {
            tracing::warn!(?err, "saving auto device number table failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env::SystemEnv, persist::MemoryPersistence};

    fn uid(tag: u8) -> [u8; 16] {
        let mut id = [0u8; 16];
        id[0] = tag;
        id
    }

    #[test]
    fn unique_ids_get_stable_numbers() {
        let env = SystemEnv;
        let mut store = MemoryPersistence::new();
        let mut autonr = AutoNumbers::default();

        let a = autonr.assign(Some(uid(1)), Some(&mut store), &env, |_| false);
        let b = autonr.assign(Some(uid(2)), Some(&mut store), &env, |_| false);
        assert_ne!(a, b);
        assert!((RESERVED_START..=RESERVED_END).contains(&a));

        // Same hardware asks again: same answer, even from fresh state
        // reading the persisted table.
        let mut autonr2 = AutoNumbers::default();
        assert_eq!(autonr2.assign(Some(uid(1)), Some(&mut store), &env, |_| false), a);
        assert_eq!(autonr2.assign(Some(uid(2)), Some(&mut store), &env, |_| false), b);
    }

    #[test]
    fn anonymous_clients_count_up() {
        let env = SystemEnv;
        let mut autonr = AutoNumbers::default();
        let a = autonr.assign(None, None, &env, |_| false);
        let b = autonr.assign(None, None, &env, |_| false);
        assert_eq!(a, MONOTONIC_START);
        assert_eq!(b, MONOTONIC_START + 1);
    }

    #[test]
    fn zero_unique_id_counts_as_absent() {
        let env = SystemEnv;
        let mut autonr = AutoNumbers::default();
        let nr = autonr.assign(Some([0u8; 16]), None, &env, |_| false);
        assert_eq!(nr, MONOTONIC_START);
    }

    #[test]
    fn full_table_reuses_least_recently_issued_slot() {
        let env = SystemEnv;
        let mut autonr = AutoNumbers::default();
        let first = autonr.assign(Some(uid(1)), None, &env, |_| false);
        for tag in 2..=(TABLE_SLOTS as u8) {
            autonr.assign(Some(uid(tag)), None, &env, |_| false);
        }
        // Refresh tag 1 so it is no longer the oldest.
        assert_eq!(autonr.assign(Some(uid(1)), None, &env, |_| false), first);

        // Table is full; a new id evicts the oldest slot (tag 2), while
        // tag 1 keeps its number.
        autonr.assign(Some(uid(200)), None, &env, |_| false);
        assert_eq!(autonr.assign(Some(uid(1)), None, &env, |_| false), first);
        let reassigned = autonr.assign(Some(uid(2)), None, &env, |_| false);
        assert_ne!(reassigned, first);
    }
}
