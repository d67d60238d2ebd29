//! Key to replica mapping.
//!
//! The 32-bit hash space is cut into one slot per registered member. A key's
//! first slot is `floor(h / hashDivisor)`; further replicas are
//! `replicaOffset` slots apart. Slots belonging to members that are not up
//! resolve to the next up member, so a member going down or coming back only
//! moves the keys it held.

use crate::member::{Member, Status};

/// Deterministic 32-bit key hash (CRC-32/IEEE).
pub fn checksum32(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

/// Immutable routing snapshot derived from the registry.
///
/// A new set is derived whenever a member's status changes; existing sets
/// are never modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSet {
    /// Names of up members, ascending.
    members: Vec<String>,
    /// Registry position of each entry in `members`.
    positions: Vec<usize>,
    /// Registry size at derivation time.
    slots: usize,
    replicas: usize,
    replica_offset: usize,
}

impl ActiveSet {
    /// Derives the active set from members already sorted by name.
    pub fn derive(members: &[&dyn Member], replicas: usize) -> Self {
        let slots = members.len();
        let replicas = replicas.max(1);
        let (positions, members) = members
            .iter()
            .enumerate()
            .filter(|(_, member)| member.status() == Status::Up)
            .map(|(position, member)| (position, member.name().to_string()))
            .unzip();

        Self {
            members,
            positions,
            slots,
            replicas,
            replica_offset: (slots / replicas).max(1),
        }
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.iter().any(|member| member == name)
    }

    /// Lowest-named up member.
    pub fn leader(&self) -> Option<&str> {
        self.members.first().map(String::as_str)
    }

    /// Width of one slot in the 32-bit hash space.
    pub fn hash_divisor(&self) -> f64 {
        if self.slots == 0 {
            return 0.0;
        }
        (1u64 << 32) as f64 / self.slots as f64
    }

    pub fn replica_offset(&self) -> usize {
        self.replica_offset
    }

    /// Registry slot a key hashes to, in `[0, slots)`.
    pub fn slot_of(&self, key: &str) -> usize {
        // Same as floor(h / (2^32 / slots)) without floating point.
        ((checksum32(key) as u64 * self.slots as u64) >> 32) as usize
    }

    /// The distinct members that hold `key`, primary first.
    pub fn targets(&self, key: &str) -> Vec<&str> {
        let active = self.members.len();
        let count = self.replicas.min(active);
        if count == 0 {
            return Vec::new();
        }

        let start = self.slot_of(key);
        let mut chosen: Vec<usize> = Vec::with_capacity(count);
        for i in 0..count {
            let slot = (start + i * self.replica_offset) % self.slots;
            let mut index = self.active_index_for(slot);
            while chosen.contains(&index) {
                index = (index + 1) % active;
            }
            chosen.push(index);
        }

        chosen
            .into_iter()
            .map(|index| self.members[index].as_str())
            .collect()
    }

    /// First up member at or after a registry slot, wrapping around.
    fn active_index_for(&self, slot: usize) -> usize {
        self.positions.partition_point(|&position| position < slot) % self.members.len()
    }
}
