//! Ambient random state and deterministic sharded initialisation.
//!
//! Every thread (one per rank) owns an *ambient* [`StdRng`], seeded from [`DEFAULT_SEED`] until
//! [`manual_seed`] is called. Parameter initialisation never draws from it directly: a layer
//! takes a [`Randomizer`] at construction and fills its shards inside [`Randomizer::fork`],
//! which snapshots the ambient generator and puts it back when the guard is dropped.
//!
//! Inside the fork the generator is re-keyed for every *global* row of the logical parameter,
//! from `(randomizer seed, parameter stream, row)`. A rank only visits the rows (or the column
//! slice of each row) it owns, so shards differ across ranks while the reassembled parameter is
//! the same for any world size.
//!
//! ```rust
//! use tp_linear::random::{manual_seed, with_rng, Randomizer};
//! use rand::Rng;
//!
//! manual_seed(7);
//! let before: u64 = with_rng(|rng| rng.clone().random());
//! {
//!     let _fork = Randomizer::new(123).fork();
//!     let _: u64 = with_rng(|rng| rng.random());
//! }
//! let after: u64 = with_rng(|rng| rng.random());
//! assert_eq!(before, after);
//! ```

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::{Cell, RefCell};

/// Seed of the ambient generator on a thread that never called [`manual_seed`].
pub const DEFAULT_SEED: u64 = 42;

struct Ambient {
    initial_seed: u64,
    rng: StdRng,
}

impl Ambient {
    fn seeded(seed: u64) -> Self {
        Self {
            initial_seed: seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

thread_local! {
    static AMBIENT: RefCell<Ambient> = RefCell::new(Ambient::seeded(DEFAULT_SEED));
    static RANDOMIZER_INDEX: Cell<u64> = const { Cell::new(0) };
}

/// Reseeds this thread's ambient generator and records `seed` as its initial seed.
pub fn manual_seed(seed: u64) {
    AMBIENT.with(|a| *a.borrow_mut() = Ambient::seeded(seed));
}

/// The seed this thread's ambient generator was last seeded with.
pub fn initial_seed() -> u64 {
    AMBIENT.with(|a| a.borrow().initial_seed)
}

/// Runs `f` with exclusive access to this thread's ambient generator.
///
/// `f` must not call back into this module.
pub fn with_rng<F, R>(f: F) -> R
where
    F: FnOnce(&mut StdRng) -> R,
{
    AMBIENT.with(|a| f(&mut a.borrow_mut().rng))
}

/// Opaque snapshot of an ambient generator.
#[derive(Clone, Debug)]
pub struct RngState {
    initial_seed: u64,
    rng: StdRng,
}

/// Snapshots this thread's ambient generator.
pub fn rng_state() -> RngState {
    AMBIENT.with(|a| {
        let a = a.borrow();
        RngState {
            initial_seed: a.initial_seed,
            rng: a.rng.clone(),
        }
    })
}

/// Replaces this thread's ambient generator with a snapshot.
pub fn set_rng_state(state: RngState) {
    AMBIENT.with(|a| {
        *a.borrow_mut() = Ambient {
            initial_seed: state.initial_seed,
            rng: state.rng,
        }
    });
}

/// Snapshots the ambient generator and restores it when dropped.
///
/// Restoration happens on every exit path of the scope holding the guard, including `?` returns
/// and unwinding panics.
#[must_use = "the ambient generator is restored when the guard is dropped"]
#[derive(Debug)]
pub struct RngFork {
    saved: Option<RngState>,
}

/// Starts a scope whose ambient random draws do not leak out of it.
pub fn fork_rng() -> RngFork {
    RngFork {
        saved: Some(rng_state()),
    }
}

impl Drop for RngFork {
    fn drop(&mut self) {
        if let Some(state) = self.saved.take() {
            set_rng_state(state);
        }
    }
}

/// Identifies the random stream a layer initialises its parameters from.
///
/// Built with [`Randomizer::with_index`], the seed is the base seed plus a per-thread index
/// bumped once per layer. Since every rank constructs the same layers in the same order, all
/// ranks agree on each layer's seed without communicating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Randomizer {
    seed: u64,
}

impl Randomizer {
    pub const fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Takes the next per-thread randomizer index and offsets `base_seed` by it.
    pub fn with_index(base_seed: u64) -> Self {
        let index = RANDOMIZER_INDEX.with(|i| {
            let current = i.get();
            i.set(current + 1);
            current
        });
        Self::new(base_seed.wrapping_add(index))
    }

    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Forks the ambient generator and reseeds it with this randomizer's seed.
    pub fn fork(&self) -> RngFork {
        let fork = fork_rng();
        with_rng(|rng| *rng = StdRng::seed_from_u64(self.seed));
        fork
    }

    /// Re-keys the ambient generator for one row of one parameter.
    ///
    /// Call only while holding the guard returned by [`Randomizer::fork`].
    pub fn rekey(&self, stream: u64, row: u64) {
        let mut key = [0u8; 32];
        key[..8].copy_from_slice(&self.seed.to_le_bytes());
        key[8..16].copy_from_slice(&stream.to_le_bytes());
        key[16..24].copy_from_slice(&row.to_le_bytes());
        key[24..].copy_from_slice(b"tp-shard");
        with_rng(|rng| *rng = StdRng::from_seed(key));
    }
}

/// Current value of this thread's randomizer index.
pub fn randomizer_index() -> u64 {
    RANDOMIZER_INDEX.with(Cell::get)
}

/// Resets this thread's randomizer index to zero.
pub fn reset_randomizer_index() {
    RANDOMIZER_INDEX.with(|i| i.set(0));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn draw() -> u64 {
        with_rng(|rng| rng.random())
    }

    #[test]
    fn test_manual_seed_is_reproducible() {
        manual_seed(11);
        let a = draw();
        manual_seed(11);
        assert_eq!(draw(), a);
        assert_eq!(initial_seed(), 11);
    }

    #[test]
    fn test_state_roundtrip() {
        manual_seed(3);
        let state = rng_state();
        let a = draw();
        set_rng_state(state);
        assert_eq!(draw(), a);
    }

    #[test]
    fn test_fork_restores_on_drop() {
        manual_seed(5);
        let expected = rng_state();
        {
            let _fork = fork_rng();
            manual_seed(99);
            draw();
        }
        assert_eq!(initial_seed(), 5);
        let mut expected_rng = expected.rng;
        assert_eq!(draw(), expected_rng.random::<u64>());
    }

    #[test]
    fn test_fork_restores_on_error_path() {
        fn failing() -> Result<(), String> {
            let _fork = Randomizer::new(1).fork();
            draw();
            Err("boom".to_string())
        }

        manual_seed(8);
        let snapshot = rng_state();
        assert!(failing().is_err());
        let mut expected = snapshot.rng;
        assert_eq!(draw(), expected.random::<u64>());
    }

    #[test]
    fn test_fork_restores_on_panic() {
        manual_seed(21);
        let snapshot = rng_state();
        let result = std::panic::catch_unwind(|| {
            let _fork = Randomizer::new(2).fork();
            draw();
            panic!("initialiser failed");
        });
        assert!(result.is_err());
        let mut expected = snapshot.rng;
        assert_eq!(draw(), expected.random::<u64>());
    }

    #[test]
    fn test_randomizer_index_advances() {
        reset_randomizer_index();
        let a = Randomizer::with_index(100);
        let b = Randomizer::with_index(100);
        assert_eq!(a.seed(), 100);
        assert_eq!(b.seed(), 101);
        assert_eq!(randomizer_index(), 2);
    }

    #[test]
    fn test_rekey_depends_on_row_and_stream() {
        let r = Randomizer::new(9);
        let _fork = r.fork();
        r.rekey(0, 0);
        let a = draw();
        r.rekey(0, 1);
        let b = draw();
        r.rekey(1, 0);
        let c = draw();
        r.rekey(0, 0);
        assert_eq!(draw(), a);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
