//! Work partitioning for one-dimensional problems.

use std::fmt;

/// Default ceiling on the number of work-items in the first local dimension.
pub const MAX_THREADS: usize = 512;

/// An N-dimensional range of at most three components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NdRange {
    dims: [usize; 3],
    len: usize,
}

impl NdRange {
    pub fn one(x: usize) -> Self {
        Self { dims: [x, 1, 1], len: 1 }
    }

    pub fn two(x: usize, y: usize) -> Self {
        Self { dims: [x, y, 1], len: 2 }
    }

    pub fn three(x: usize, y: usize, z: usize) -> Self {
        Self { dims: [x, y, z], len: 3 }
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.dims[..self.len]
    }

    pub fn dimensions(&self) -> usize {
        self.len
    }

    pub fn x(&self) -> usize {
        self.dims[0]
    }

    /// Product of all components.
    pub fn volume(&self) -> usize {
        self.as_slice().iter().product()
    }
}

impl fmt::Display for NdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, d) in self.as_slice().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", d)?;
        }
        f.write_str(")")
    }
}

/// Local and global ranges for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub local: NdRange,
    pub global: NdRange,
}

/// Partitions `size` under the default [`MAX_THREADS`] ceiling.
pub fn partition(size: usize) -> Partition {
    partition_with_ceiling(size, MAX_THREADS)
}

/// Partitions `size` work-items.
///
/// Sizes up to `ceiling` run as a single group. Larger sizes use the largest
/// divisor `i <= ceiling` as `(i, size / i)`; a size with no divisor above 1
/// degrades to `(1, size)`. The global range is always `(size)`.
pub fn partition_with_ceiling(size: usize, ceiling: usize) -> Partition {
    let global = NdRange::one(size);

    if size <= ceiling {
        return Partition {
            local: NdRange::one(size.min(ceiling)),
            global,
        };
    }

    let divisor = (1..=ceiling).rev().find(|i| size % i == 0).unwrap_or(1);
    Partition {
        local: NdRange::two(divisor, size / divisor),
        global,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_table() {
        let cases: &[(usize, &[usize])] = &[
            (100, &[100]),
            (1, &[1]),
            (512, &[512]),
            (1024, &[512, 2]),
            (1000, &[500, 2]),
            (513, &[171, 3]),
        ];

        for (size, local) in cases {
            let p = partition(*size);
            assert_eq!(p.local.as_slice(), *local, "size {}", size);
            assert_eq!(p.global.as_slice(), &[*size]);
        }
    }

    #[test]
    fn test_prime_above_ceiling() {
        let p = partition(521);
        assert_eq!(p.local.as_slice(), &[1, 521]);
        assert_eq!(p.global, NdRange::one(521));
    }

    #[test]
    fn test_zero_size() {
        let p = partition(0);
        assert_eq!(p.local, NdRange::one(0));
        assert_eq!(p.global, NdRange::one(0));
    }

    #[test]
    fn test_custom_ceiling() {
        let p = partition_with_ceiling(1024, 256);
        assert_eq!(p.local.as_slice(), &[256, 4]);

        let p = partition_with_ceiling(200, 256);
        assert_eq!(p.local.as_slice(), &[200]);
    }

    #[test]
    fn test_local_divides_global() {
        for size in [600, 777, 4096, 10_000, 65_537] {
            let p = partition(size);
            let local = p.local.as_slice();
            assert_eq!(local[0] * local[1], size);
            assert!(local[0] <= MAX_THREADS);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(NdRange::two(512, 2).to_string(), "(512, 2)");
        assert_eq!(NdRange::one(7).volume(), 7);
    }
}
