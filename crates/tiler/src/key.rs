use std::fmt;

/// Address of one grid cell. Ordered by (x, y, z, level).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BucketKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub level: i32,
}

impl BucketKey {
    #[inline]
    pub const fn new(x: i32, y: i32, z: i32, level: i32) -> Self {
        Self { x, y, z, level }
    }

    /// Key one level finer. Bits 0, 1 and 2 of `dir` pick the upper half along x, y and z.
    #[inline]
    pub fn child(self, dir: u8) -> Self {
        Self {
            x: (self.x << 1) | (dir & 1) as i32,
            y: (self.y << 1) | ((dir >> 1) & 1) as i32,
            z: (self.z << 1) | ((dir >> 2) & 1) as i32,
            level: self.level + 1,
        }
    }

    /// Key one level coarser. The root is its own parent.
    #[inline]
    pub fn parent(self) -> Self {
        Self {
            x: self.x >> 1,
            y: self.y >> 1,
            z: self.z >> 1,
            level: (self.level - 1).max(0),
        }
    }

    #[inline]
    pub fn to_array(self) -> [i32; 4] {
        [self.x, self.y, self.z, self.level]
    }

    /// Stable shard index in `0..n`, independent of the process's hasher seed.
    #[inline]
    pub(crate) fn shard(self, n: usize) -> usize {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for v in self.to_array() {
            h ^= v as u32 as u64;
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
        (h % n.max(1) as u64) as usize
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.level, self.x, self.y, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_round_trip_through_parent() {
        let key = BucketKey::new(3, 5, 1, 2);

        for dir in 0..8u8 {
            let child = key.child(dir);
            assert_eq!(child.level, 3);
            assert_eq!(child.parent(), key);
        }

        assert_eq!(key.child(0b101), BucketKey::new(7, 10, 3, 3));
        assert_eq!(BucketKey::default().parent(), BucketKey::default());
    }

    #[test]
    fn orders_by_coordinates_then_level() {
        let mut keys = vec![
            BucketKey::new(1, 0, 0, 0),
            BucketKey::new(0, 0, 1, 0),
            BucketKey::new(0, 0, 0, 1),
            BucketKey::new(0, 1, 0, 0),
        ];
        keys.sort();

        assert_eq!(
            keys,
            vec![
                BucketKey::new(0, 0, 0, 1),
                BucketKey::new(0, 0, 1, 0),
                BucketKey::new(0, 1, 0, 0),
                BucketKey::new(1, 0, 0, 0),
            ]
        );
    }

    #[test]
    fn displays_level_first() {
        assert_eq!(BucketKey::new(4, -2, 7, 3).to_string(), "3-4--2-7");
    }

    #[test]
    fn shard_is_stable_and_in_range() {
        let key = BucketKey::new(12, 7, 3, 4);
        assert_eq!(key.shard(5), key.shard(5));
        for n in 1..9 {
            assert!(key.shard(n) < n);
        }
    }
}
