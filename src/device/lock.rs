//! Semaphore locks and per-tile lock tables.
//!
//! AIE2 locks are 6-bit counting semaphores used purely for
//! producer/consumer handshakes. Each tile owns a [`LockTable`] keyed by
//! purpose name; hardware ids are handed out in declaration order when
//! the table is built, so there is no global numbering.
//!
//! # Semaphore Model
//!
//! - `acquire_exact()`: succeeds when the value is > 0, then decrements by 1.
//! - `acquire_at_least(n)`: succeeds when the value is >= n, then
//!   decrements by n (hardware `AcquireGreaterEqual`).
//! - `release(n)`: increments by n, saturating at [`Lock::MAX_VALUE`].
//!
//! A failed acquire leaves the lock untouched; the caller stays in its
//! wait state and retries on its next turn. There is no timeout.

use std::collections::BTreeMap;

use super::aie2_spec;
use super::TileCoord;
use crate::error::ConfigError;

/// Result of a lock operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// Operation succeeded.
    Success,
    /// Acquire condition not met; caller must wait.
    WouldBlock,
    /// Release saturated at `MAX_VALUE`.
    WouldOverflow,
}

/// Lock state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lock {
    /// Current semaphore count (0-63).
    pub value: u8,
    /// Set when a release saturated.
    pub overflow: bool,
}

impl Lock {
    /// Maximum lock value (6-bit).
    pub const MAX_VALUE: u8 = aie2_spec::LOCK_MAX_VALUE;

    /// Create a lock with an initial value (clamped to 0-63).
    #[inline]
    pub fn new(value: u8) -> Self {
        Self { value: value.min(Self::MAX_VALUE), overflow: false }
    }

    /// Decrement by one if the value is non-zero.
    #[inline]
    pub fn acquire_exact(&mut self) -> LockResult {
        self.acquire_at_least(1)
    }

    /// Wait for `value >= n`, then decrement by `n`.
    ///
    /// `n == 0` always succeeds and leaves the value unchanged.
    #[inline]
    pub fn acquire_at_least(&mut self, n: u8) -> LockResult {
        if self.value < n {
            return LockResult::WouldBlock;
        }
        self.value -= n;
        LockResult::Success
    }

    /// Increment by `n`, saturating at `MAX_VALUE`.
    #[inline]
    pub fn release(&mut self, n: u8) -> LockResult {
        let new_value = self.value as u16 + n as u16;
        if new_value > Self::MAX_VALUE as u16 {
            self.overflow = true;
            self.value = Self::MAX_VALUE;
            return LockResult::WouldOverflow;
        }
        self.value = new_value as u8;
        LockResult::Success
    }

    /// Apply a [`LockAction`].
    pub fn apply(&mut self, action: LockAction) -> LockResult {
        match action {
            LockAction::Acquire => self.acquire_exact(),
            LockAction::AcquireGreaterEqual(n) => self.acquire_at_least(n),
            LockAction::Release(n) => self.release(n),
        }
    }
}

/// Lock identifier (tile + hardware id within the tile).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId {
    /// Tile containing the lock.
    pub tile: TileCoord,
    /// Id within the tile (0-15 compute/shim, 0-63 mem tile).
    pub index: u8,
}

impl LockId {
    #[inline]
    pub const fn new(tile: TileCoord, index: u8) -> Self {
        Self { tile, index }
    }
}

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Lock[{}:{}]", self.tile, self.index)
    }
}

/// What a program does with a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAction {
    /// Exact acquire: wait for > 0, decrement by 1.
    Acquire,
    /// Wait for >= n, decrement by n.
    AcquireGreaterEqual(u8),
    /// Increment by n.
    Release(u8),
}

impl LockAction {
    #[inline]
    pub fn is_acquire(self) -> bool {
        !matches!(self, LockAction::Release(_))
    }

    /// Amount the counter changes by when the action succeeds.
    #[inline]
    pub fn amount(self) -> u8 {
        match self {
            LockAction::Acquire => 1,
            LockAction::AcquireGreaterEqual(n) | LockAction::Release(n) => n,
        }
    }
}

/// A resolved lock operation inside a channel step or core program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockUse {
    pub lock: LockId,
    pub action: LockAction,
}

impl LockUse {
    pub fn new(lock: LockId, action: LockAction) -> Self {
        Self { lock, action }
    }
}

/// Declaration of one lock in a tile's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDecl {
    pub id: LockId,
    pub name: String,
    pub init: u8,
}

/// Per-tile lock table keyed by purpose name.
#[derive(Debug, Clone)]
pub struct LockTable {
    tile: TileCoord,
    capacity: usize,
    decls: Vec<LockDecl>,
    by_name: BTreeMap<String, u8>,
}

impl LockTable {
    /// Empty table for a tile with `capacity` hardware locks.
    pub fn new(tile: TileCoord, capacity: usize) -> Self {
        Self { tile, capacity, decls: Vec::new(), by_name: BTreeMap::new() }
    }

    /// Declare a lock; the next free hardware id is assigned.
    pub fn declare(&mut self, name: &str, init: u8) -> Result<LockId, ConfigError> {
        let tile = self.tile;
        if self.by_name.contains_key(name) {
            return Err(ConfigError::DuplicateName { tile, kind: "lock", name: name.to_string() });
        }
        if self.decls.len() >= self.capacity {
            return Err(ConfigError::LockTableFull { tile, capacity: self.capacity });
        }
        if init > Lock::MAX_VALUE {
            return Err(ConfigError::LockInitOutOfRange { tile, name: name.to_string(), init });
        }

        let id = LockId::new(tile, self.decls.len() as u8);
        self.by_name.insert(name.to_string(), id.index);
        self.decls.push(LockDecl { id, name: name.to_string(), init });
        Ok(id)
    }

    /// Resolve a purpose name.
    pub fn get(&self, name: &str) -> Option<LockId> {
        self.by_name.get(name).map(|&index| LockId::new(self.tile, index))
    }

    /// Resolve a purpose name or report it missing.
    pub fn resolve(&self, name: &str) -> Result<LockId, ConfigError> {
        self.get(name).ok_or_else(|| ConfigError::MissingLock {
            tile: self.tile,
            name: name.to_string(),
        })
    }

    /// Declaration for a lock id.
    pub fn decl(&self, id: LockId) -> Option<&LockDecl> {
        if id.tile != self.tile {
            return None;
        }
        self.decls.get(id.index as usize)
    }

    /// All declarations in id order.
    pub fn decls(&self) -> &[LockDecl] {
        &self.decls
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    /// Fresh lock state with every initial value applied.
    pub fn instantiate(&self) -> Vec<Lock> {
        self.decls.iter().map(|d| Lock::new(d.init)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_exact() {
        let mut lock = Lock::new(1);
        assert_eq!(lock.acquire_exact(), LockResult::Success);
        assert_eq!(lock.value, 0);
        assert_eq!(lock.acquire_exact(), LockResult::WouldBlock);
        assert_eq!(lock.value, 0);
    }

    #[test]
    fn test_acquire_at_least() {
        let mut lock = Lock::new(2);
        assert_eq!(lock.acquire_at_least(3), LockResult::WouldBlock);
        assert_eq!(lock.value, 2, "failed acquire must not change the value");
        assert_eq!(lock.acquire_at_least(2), LockResult::Success);
        assert_eq!(lock.value, 0);
    }

    #[test]
    fn test_release_saturates() {
        let mut lock = Lock::new(62);
        assert_eq!(lock.release(1), LockResult::Success);
        assert_eq!(lock.value, 63);
        assert_eq!(lock.release(1), LockResult::WouldOverflow);
        assert_eq!(lock.value, 63);
        assert!(lock.overflow);
    }

    #[test]
    fn test_release_wakes_waiter() {
        let mut lock = Lock::new(0);
        assert_eq!(lock.apply(LockAction::AcquireGreaterEqual(1)), LockResult::WouldBlock);
        lock.apply(LockAction::Release(1));
        assert_eq!(lock.apply(LockAction::AcquireGreaterEqual(1)), LockResult::Success);
    }

    #[test]
    fn test_new_clamps() {
        assert_eq!(Lock::new(200).value, Lock::MAX_VALUE);
    }

    #[test]
    fn test_table_assigns_ids_in_order() {
        let tile = TileCoord::new(0, 1);
        let mut table = LockTable::new(tile, 64);
        let a = table.declare("read_in_a", 1).unwrap();
        let b = table.declare("write_out_a", 0).unwrap();
        assert_eq!(a, LockId::new(tile, 0));
        assert_eq!(b, LockId::new(tile, 1));
        assert_eq!(table.get("write_out_a"), Some(b));
        assert_eq!(table.decl(a).unwrap().init, 1);

        let state = table.instantiate();
        assert_eq!(state[0].value, 1);
        assert_eq!(state[1].value, 0);
    }

    #[test]
    fn test_table_rejects_duplicates_and_overflow() {
        let tile = TileCoord::new(0, 2);
        let mut table = LockTable::new(tile, 2);
        table.declare("x", 0).unwrap();
        assert!(matches!(table.declare("x", 0), Err(ConfigError::DuplicateName { .. })));
        table.declare("y", 0).unwrap();
        assert!(matches!(table.declare("z", 0), Err(ConfigError::LockTableFull { .. })));
    }

    #[test]
    fn test_table_missing_lock() {
        let table = LockTable::new(TileCoord::new(0, 2), 16);
        assert!(matches!(table.resolve("nope"), Err(ConfigError::MissingLock { .. })));
    }
}
