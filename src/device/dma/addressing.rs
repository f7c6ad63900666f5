//! Two-dimensional address generation for DMA transfers.
//!
//! A [`BufferDescriptor`] walks an outer dimension (rows) and an inner
//! dimension (elements within a row). Addresses are element indices into
//! a linear buffer.
//!
//! # Address Generation
//!
//! For a descriptor with:
//! - Base offset: 8
//! - Inner: count=4, stride=1
//! - Outer: count=2, stride=16
//!
//! Generated addresses:
//! ```text
//! Row 0:  8,  9, 10, 11
//! Row 1: 24, 25, 26, 27
//! ```
//!
//! The inner dimension advances fastest; after it wraps, the outer
//! counter steps by `outer_stride`.

use super::BufferDescriptor;

/// Address generator over one descriptor.
#[derive(Debug, Clone)]
pub struct AddressGenerator {
    descriptor: BufferDescriptor,
    /// Position in the inner dimension.
    inner: usize,
    /// Position in the outer dimension.
    outer: usize,
    total_elements: usize,
    elements_generated: usize,
}

impl AddressGenerator {
    pub fn new(descriptor: BufferDescriptor) -> Self {
        Self {
            descriptor,
            inner: 0,
            outer: 0,
            total_elements: descriptor.element_count(),
            elements_generated: 0,
        }
    }

    /// Address at the current position.
    #[inline]
    pub fn current(&self) -> usize {
        self.descriptor.base_offset
            + self.outer * self.descriptor.outer_stride
            + self.inner * self.descriptor.inner_stride
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.elements_generated >= self.total_elements
    }

    #[inline]
    pub fn total_elements(&self) -> usize {
        self.total_elements
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.total_elements.saturating_sub(self.elements_generated)
    }

    /// Return the next address, or None once every element was produced.
    pub fn next_address(&mut self) -> Option<usize> {
        if self.is_finished() {
            return None;
        }

        let addr = self.current();
        self.elements_generated += 1;

        self.inner += 1;
        if self.inner >= self.descriptor.inner_count {
            self.inner = 0;
            self.outer += 1;
        }

        Some(addr)
    }

    /// Restart from the first address.
    pub fn reset(&mut self) {
        self.inner = 0;
        self.outer = 0;
        self.elements_generated = 0;
    }
}

impl Iterator for AddressGenerator {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_address()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for AddressGenerator {}

/// Read the elements a descriptor addresses, in transfer order.
///
/// The descriptor must have been validated against `memory.len()`.
pub fn gather(memory: &[i32], descriptor: &BufferDescriptor) -> Vec<i32> {
    let data: Vec<i32> = descriptor.addresses().map(|addr| memory[addr]).collect();
    log::trace!("gather {} -> {} elements", descriptor, data.len());
    data
}

/// Write `data` to the addresses a descriptor covers, in transfer order.
///
/// Returns the number of elements written; extra data beyond the
/// descriptor's element count is ignored.
pub fn scatter(memory: &mut [i32], descriptor: &BufferDescriptor, data: &[i32]) -> usize {
    let mut written = 0;
    for (addr, &value) in descriptor.addresses().zip(data) {
        memory[addr] = value;
        written += 1;
    }
    log::trace!("scatter {} <- {} elements", descriptor, written);
    written
}
