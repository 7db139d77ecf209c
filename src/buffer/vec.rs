use std::ops::{Deref, DerefMut};
use super::{Buffer};

/**
 * A [`Buffer`] backed by a `Vec<u8>` that grows geometrically: the capacity
 * doubles when exhausted, with a floor chosen at construction so that small
 * buffers do not reallocate repeatedly.
 */
#[allow(clippy::module_name_repetitions)]
pub struct VecU8 {
    data: Vec<u8>,
    minimum_capacity: usize,
}

impl VecU8 {
    pub fn new(minimum_capacity: usize) -> Self {
        VecU8 {data: Vec::new(), minimum_capacity}
    }

    fn ensure(&mut self, space: usize) {
        let needed = self.data.len() + space;
        if needed > self.data.capacity() {
            let new_capacity = std::cmp::max(
                needed,
                std::cmp::max(self.minimum_capacity, self.data.capacity() * 2),
            );
            self.data.reserve_exact(new_capacity - self.data.len());
        }
    }
}

impl Deref for VecU8 {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for VecU8 {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Buffer for VecU8 {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn append(&mut self, v: u8) {
        self.ensure(1);
        self.data.push(v);
    }
}

//-----------------------------------------------------------------------------
