//! Comparator bridge: installs a caller-defined key order into the engine.
//!
//! The engine never calls a user closure directly. At open time the
//! comparator is installed into a process-wide registry under an opaque
//! [`ComparatorToken`], and the engine holds a [`ComparatorBridge`] that
//! carries the token, an owned copy of the name bytes and the comparison
//! function itself.
//!
//! Release is explicit: [`ComparatorBridge::release`] runs once, as the last
//! step of engine close, and removes the registry entry. Releasing twice is a
//! programming fault and panics.
//!
//! The name is persisted in the store identity file. Opening existing data
//! with a differently named comparator fails with `ComparatorMismatch`;
//! changing the ordering behind an unchanged name is unsupported and will
//! corrupt iteration order.

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};

/// Longest comparator name accepted (it is stored with a one-byte length).
pub const MAX_COMPARATOR_NAME_LEN: usize = 255;

/// A strict total order over byte-string keys.
///
/// Implementations must be pure and deterministic: the same two inputs must
/// always produce the same answer, for as long as any data written under
/// this comparator exists.
pub trait KeyComparator: Send + Sync {
    /// Stable ASCII name, checked against the store on every open.
    fn name(&self) -> &str;

    /// Three-way comparison of two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Lexicographic order over unsigned bytes. The default comparator.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    fn name(&self) -> &str {
        "ordstore.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Adapts a named closure into a [`KeyComparator`].
pub struct FnComparator<F> {
    name: String,
    cmp: F,
}

impl<F> FnComparator<F>
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    /// Wrap `cmp` under `name`.
    pub fn new(name: impl Into<String>, cmp: F) -> Self {
        Self {
            name: name.into(),
            cmp,
        }
    }
}

impl<F> KeyComparator for FnComparator<F>
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.cmp)(a, b)
    }
}

impl<F> fmt::Debug for FnComparator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnComparator").field("name", &self.name).finish()
    }
}

/// Opaque handle identifying one installed comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComparatorToken(u64);

/// Registry entry: the comparison function and its owned name bytes.
struct Installed {
    name: Box<[u8]>,
    comparator: Arc<dyn KeyComparator>,
}

fn registry() -> &'static Mutex<HashMap<ComparatorToken, Arc<Installed>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<ComparatorToken, Arc<Installed>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Number of comparators currently installed in this process.
///
/// Every open engine holds exactly one entry; it returns to its previous
/// value once the engine is closed.
pub fn installed_count() -> usize {
    registry().lock().len()
}

/// Whether `token` still names an installed comparator.
pub fn is_installed(token: ComparatorToken) -> bool {
    registry().lock().contains_key(&token)
}

/// The engine's view of an installed comparator.
///
/// Cloning is cheap and shares the entry. Only the engine that installed it
/// calls [`release`](Self::release).
#[derive(Clone)]
pub struct ComparatorBridge {
    token: ComparatorToken,
    installed: Arc<Installed>,
    released: Arc<AtomicBool>,
}

impl ComparatorBridge {
    /// Validate the comparator name and install it under a fresh token.
    pub fn install(comparator: Arc<dyn KeyComparator>) -> StoreResult<Self> {
        let name = comparator.name();
        if name.is_empty() || !name.is_ascii() || name.len() > MAX_COMPARATOR_NAME_LEN {
            return Err(StoreError::InvalidComparatorName(name.to_string()));
        }

        let installed = Arc::new(Installed {
            name: name.as_bytes().to_vec().into_boxed_slice(),
            comparator,
        });
        let token = ComparatorToken(NEXT_TOKEN.fetch_add(1, AtomicOrdering::Relaxed));
        registry().lock().insert(token, Arc::clone(&installed));

        Ok(Self {
            token,
            installed,
            released: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Install the default bytewise order.
    pub fn bytewise() -> Self {
        // A static ASCII name always validates.
        match Self::install(Arc::new(BytewiseComparator)) {
            Ok(bridge) => bridge,
            Err(e) => unreachable!("bytewise comparator rejected: {}", e),
        }
    }

    /// Compare two keys under the installed order.
    #[inline]
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.installed.comparator.compare(a, b)
    }

    /// The comparator's name, as persisted in the identity file.
    pub fn name(&self) -> &str {
        // Validated as ASCII at install time.
        std::str::from_utf8(&self.installed.name).unwrap_or_default()
    }

    /// Registry token for this installation.
    pub fn token(&self) -> ComparatorToken {
        self.token
    }

    /// Whether [`release`](Self::release) has run.
    pub fn is_released(&self) -> bool {
        self.released.load(AtomicOrdering::Acquire)
    }

    /// Remove the registry entry. Must run exactly once, after the engine
    /// has stopped using the order.
    ///
    /// # Panics
    /// If the bridge was already released.
    pub fn release(&self) {
        let was_released = self.released.swap(true, AtomicOrdering::AcqRel);
        assert!(!was_released, "comparator {:?} released twice", self.token);

        let removed = registry().lock().remove(&self.token);
        assert!(removed.is_some(), "comparator {:?} missing from registry", self.token);
        tracing::debug!(token = self.token.0, name = self.name(), "Released comparator");
    }
}

impl fmt::Debug for ComparatorBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComparatorBridge")
            .field("token", &self.token)
            .field("name", &self.name())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytewise(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    #[test]
    fn test_bytewise_order() {
        let cmp = BytewiseComparator;
        assert_eq!(cmp.compare(b"a", b"b"), Ordering::Less);
        assert_eq!(cmp.compare(b"ab", b"a"), Ordering::Greater);
        assert_eq!(cmp.compare(b"", b""), Ordering::Equal);
        // Unsigned: 0xFF sorts after 0x00
        assert_eq!(cmp.compare(&[0xFF], &[0x00]), Ordering::Greater);
    }

    #[test]
    fn test_install_and_release() {
        let bridge = ComparatorBridge::install(Arc::new(FnComparator::new(
            "test.Reverse",
            |a: &[u8], b: &[u8]| b.cmp(a),
        )))
        .unwrap();

        assert_eq!(bridge.name(), "test.Reverse");
        assert_eq!(bridge.compare(b"a", b"b"), Ordering::Greater);
        assert!(registry().lock().contains_key(&bridge.token()));

        bridge.release();
        assert!(bridge.is_released());
        assert!(!registry().lock().contains_key(&bridge.token()));
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_double_release_panics() {
        let bridge = ComparatorBridge::bytewise();
        bridge.release();
        bridge.release();
    }

    #[test]
    fn test_invalid_names_rejected() {
        let empty = ComparatorBridge::install(Arc::new(FnComparator::new("", bytewise)));
        assert!(matches!(empty, Err(StoreError::InvalidComparatorName(_))));

        let non_ascii = ComparatorBridge::install(Arc::new(FnComparator::new("ordre.é", bytewise)));
        assert!(matches!(non_ascii, Err(StoreError::InvalidComparatorName(_))));

        let long = "x".repeat(MAX_COMPARATOR_NAME_LEN + 1);
        let too_long = ComparatorBridge::install(Arc::new(FnComparator::new(long, bytewise)));
        assert!(matches!(too_long, Err(StoreError::InvalidComparatorName(_))));
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = ComparatorBridge::bytewise();
        let b = ComparatorBridge::bytewise();
        assert_ne!(a.token(), b.token());
        a.release();
        b.release();
    }
}
