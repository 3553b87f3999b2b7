//! Property-based test generators using proptest.
//!
//! Provides strategies for generating extent sizes, contents and
//! operation sequences for [`IntegrationHarness`](crate::IntegrationHarness).

use proptest::prelude::*;

/// Granularity of generated extent lengths.
pub const BLOCK: u32 = 512;

/// One step of a generated workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Allocate an extent filled with `fill`.
    Alloc {
        /// Length in bytes.
        len: u32,
        /// Fill byte.
        fill: u8,
    },
    /// Overwrite part of an existing extent.
    Overwrite {
        /// Which extent, modulo the number tracked.
        index: usize,
        /// Offset, modulo the extent length.
        offset: u32,
        /// Bytes to write, clamped to the extent.
        len: u32,
        /// Fill byte.
        fill: u8,
    },
    /// Add a reference to an existing extent.
    IncRef {
        /// Which extent, modulo the number tracked.
        index: usize,
    },
    /// Drop a reference to an existing extent.
    DecRef {
        /// Which extent, modulo the number tracked.
        index: usize,
    },
    /// Close and mount again.
    Remount,
    /// Crash and mount the surviving image.
    Crash,
}

/// Strategy for extent lengths: whole blocks up to 16 KiB.
pub fn extent_len_strategy() -> impl Strategy<Value = u32> {
    (1u32..=32).prop_map(|blocks| blocks * BLOCK)
}

/// Strategy for logical address hints, block aligned.
pub fn laddr_hint_strategy() -> impl Strategy<Value = u64> {
    (0u64..4096).prop_map(|block| block * u64::from(BLOCK))
}

/// Strategy for extent content of a given length.
pub fn extent_data_strategy(len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), len)
}

/// Strategy for a sequence of refcount changes, `true` meaning increment.
pub fn ref_changes_strategy() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 0..32)
}

/// Strategy for a single workload step, weighted towards writes.
pub fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (extent_len_strategy(), any::<u8>()).prop_map(|(len, fill)| Op::Alloc { len, fill }),
        4 => (any::<usize>(), any::<u32>(), 1u32..2048, any::<u8>()).prop_map(
            |(index, offset, len, fill)| Op::Overwrite { index, offset, len, fill }
        ),
        1 => any::<usize>().prop_map(|index| Op::IncRef { index }),
        2 => any::<usize>().prop_map(|index| Op::DecRef { index }),
        1 => Just(Op::Remount),
        1 => Just(Op::Crash),
    ]
}

/// Strategy for a workload of up to `max` steps.
pub fn ops_strategy(max: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 1..=max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn test_extent_len_is_block_multiple() {
        let mut runner = TestRunner::default();
        for _ in 0..100 {
            let len = extent_len_strategy()
                .new_tree(&mut runner)
                .unwrap()
                .current();
            assert_eq!(len % BLOCK, 0);
            assert!((BLOCK..=32 * BLOCK).contains(&len));
        }
    }

    #[test]
    fn test_ops_strategy_bounds() {
        let mut runner = TestRunner::default();
        for _ in 0..20 {
            let ops = ops_strategy(10).new_tree(&mut runner).unwrap().current();
            assert!(!ops.is_empty() && ops.len() <= 10);
        }
    }

    proptest! {
        #[test]
        fn prop_data_has_requested_len(data in extent_data_strategy(64)) {
            prop_assert_eq!(data.len(), 64);
        }
    }
}
