//! Bounded id allocator for device nodes

use common::{Error, Result};
use protocol::DeviceId;

/// Hands out the lowest free id in `1..=capacity`
#[derive(Debug)]
pub struct IdPool {
    slots: spin::Mutex<Vec<bool>>,
}

impl IdPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: spin::Mutex::new(vec![false; capacity]),
        }
    }

    pub fn allocate(&self) -> Result<DeviceId> {
        let mut slots = self.slots.lock();
        let index = slots
            .iter()
            .position(|used| !used)
            .ok_or_else(|| Error::Resource(format!("all {} device ids in use", slots.len())))?;
        slots[index] = true;
        Ok(DeviceId(index as u32 + 1))
    }

    /// Return an id to the pool. Returns false if it was not allocated.
    pub fn release(&self, id: DeviceId) -> bool {
        let mut slots = self.slots.lock();
        match (id.0 as usize)
            .checked_sub(1)
            .and_then(|index| slots.get_mut(index))
        {
            Some(used) if *used => {
                *used = false;
                true
            }
            _ => false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|used| **used).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one_and_reuse_lowest() {
        let pool = IdPool::new(4);
        assert_eq!(pool.allocate().unwrap(), DeviceId(1));
        assert_eq!(pool.allocate().unwrap(), DeviceId(2));
        assert_eq!(pool.allocate().unwrap(), DeviceId(3));

        assert!(pool.release(DeviceId(2)));
        assert_eq!(pool.allocate().unwrap(), DeviceId(2));
        assert_eq!(pool.in_use(), 3);
    }

    #[test]
    fn test_release_unknown_id() {
        let pool = IdPool::new(2);
        assert!(!pool.release(DeviceId(0)));
        assert!(!pool.release(DeviceId(1)));
        assert!(!pool.release(DeviceId(3)));
    }

    #[test]
    fn test_exhaustion_is_resource_error() {
        let pool = IdPool::new(1);
        pool.allocate().unwrap();
        assert!(matches!(pool.allocate(), Err(Error::Resource(_))));
    }
}
