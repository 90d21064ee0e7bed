//! Host-visible tensor buffers with aliasing semantics.
//!
//! A [`TensorBuffer`] is a fixed-shape, fixed-dtype region of memory shared
//! between pipeline stages. The central operation is [`TensorBuffer::duplicate`]:
//! it produces a second handle onto the *same* storage, which is how the
//! executor makes one subgraph's output tensor be the next subgraph's input
//! tensor without a copy. Storage lives until the last handle drops.
//!
//! CPU access goes through a scoped lock ([`TensorBuffer::lock`]) that yields
//! typed slice views and releases on drop, on every exit path. Concurrent
//! locks on the same storage are an error: the executor writes host inputs,
//! drops the guard, and only then invokes the compiled graph.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{EdgeLmError, Result};

/// Element types the pipeline traffics in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Bool,
    UInt8,
    Int8,
    Int16,
    Int32,
    Float16,
    Float32,
}

impl ElementType {
    /// Size of a single element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            ElementType::Bool | ElementType::UInt8 | ElementType::Int8 => 1,
            ElementType::Int16 | ElementType::Float16 => 2,
            ElementType::Int32 | ElementType::Float32 => 4,
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            ElementType::Bool => "bool",
            ElementType::UInt8 => "uint8",
            ElementType::Int8 => "int8",
            ElementType::Int16 => "int16",
            ElementType::Int32 => "int32",
            ElementType::Float16 => "float16",
            ElementType::Float32 => "float32",
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Rust types that can view a buffer of a matching [`ElementType`].
///
/// `Float16` has no stable std counterpart; it is only ever moved around as
/// raw bytes by this runtime, so it deliberately has no `Element` impl.
pub trait Element: Copy + Default + 'static {
    const ELEMENT_TYPE: ElementType;
}

impl Element for u8 {
    const ELEMENT_TYPE: ElementType = ElementType::UInt8;
}
impl Element for i8 {
    const ELEMENT_TYPE: ElementType = ElementType::Int8;
}
impl Element for i16 {
    const ELEMENT_TYPE: ElementType = ElementType::Int16;
}
impl Element for i32 {
    const ELEMENT_TYPE: ElementType = ElementType::Int32;
}
impl Element for f32 {
    const ELEMENT_TYPE: ElementType = ElementType::Float32;
}

/// Element type plus dimensions; the full static description of a tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorType {
    element_type: ElementType,
    dims: Vec<usize>,
}

impl TensorType {
    pub fn new(element_type: ElementType, dims: &[usize]) -> Self {
        TensorType {
            element_type,
            dims: dims.to_vec(),
        }
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Total number of elements.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Total packed size in bytes.
    pub fn byte_size(&self) -> usize {
        self.num_elements() * self.element_type.size_bytes()
    }
}

/// Shared backing storage. The word-sized backing array keeps every
/// supported element view properly aligned.
struct Storage {
    words: UnsafeCell<Box<[u64]>>,
    byte_len: usize,
    locked: AtomicBool,
}

// Access to `words` is serialized by the `locked` flag; handles may move
// across threads but only one guard can exist at a time.
unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

/// A handle to a tensor buffer.
///
/// Cloning the handle via [`duplicate`](TensorBuffer::duplicate) aliases the
/// storage; the storage is freed when the last handle drops.
pub struct TensorBuffer {
    storage: Arc<Storage>,
    tensor_type: TensorType,
}

impl TensorBuffer {
    /// Allocate a zero-filled buffer of the given type.
    pub fn new(tensor_type: TensorType) -> Self {
        let byte_len = tensor_type.byte_size();
        let words = vec![0u64; byte_len.div_ceil(8)].into_boxed_slice();
        TensorBuffer {
            storage: Arc::new(Storage {
                words: UnsafeCell::new(words),
                byte_len,
                locked: AtomicBool::new(false),
            }),
            tensor_type,
        }
    }

    /// Create an independent handle aliasing the same storage.
    ///
    /// Both handles read and write the same bytes; neither owns the storage
    /// exclusively.
    pub fn duplicate(&self) -> TensorBuffer {
        TensorBuffer {
            storage: Arc::clone(&self.storage),
            tensor_type: self.tensor_type.clone(),
        }
    }

    /// Packed size in bytes.
    pub fn size(&self) -> usize {
        self.storage.byte_len
    }

    pub fn tensor_type(&self) -> &TensorType {
        &self.tensor_type
    }

    /// Whether two handles alias the same underlying storage.
    pub fn shares_storage_with(&self, other: &TensorBuffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Acquire exclusive scoped CPU access.
    ///
    /// The returned guard unlocks on drop. A second lock while a guard is
    /// alive (through any aliasing handle) is an error.
    pub fn lock(&self) -> Result<BufferGuard<'_>> {
        if self
            .storage
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(EdgeLmError::Internal(
                "tensor buffer is already locked".into(),
            ));
        }
        Ok(BufferGuard {
            storage: &self.storage,
            tensor_type: &self.tensor_type,
        })
    }

    /// Bulk-overwrite the buffer prefix from a host slice.
    ///
    /// Fails with `InvalidArgument` if the slice is larger than the buffer
    /// or its element type does not match.
    pub fn write<T: Element>(&self, data: &[T]) -> Result<()> {
        if T::ELEMENT_TYPE != self.tensor_type.element_type() {
            return Err(EdgeLmError::InvalidArgument(format!(
                "write of {} into {} buffer",
                T::ELEMENT_TYPE,
                self.tensor_type.element_type()
            )));
        }
        let write_bytes = std::mem::size_of_val(data);
        if write_bytes > self.size() {
            return Err(EdgeLmError::InvalidArgument(format!(
                "write of {write_bytes} bytes exceeds buffer size {}",
                self.size()
            )));
        }
        let mut guard = self.lock()?;
        guard.as_mut_slice::<T>()?[..data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl std::fmt::Debug for TensorBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TensorBuffer(dims={:?}, dtype={})",
            self.tensor_type.dims(),
            self.tensor_type.element_type()
        )
    }
}

/// Exclusive scoped view into a buffer's bytes. Unlocks on drop.
pub struct BufferGuard<'a> {
    storage: &'a Storage,
    tensor_type: &'a TensorType,
}

impl BufferGuard<'_> {
    pub fn bytes(&self) -> &[u8] {
        // Safety: the lock flag guarantees this guard is the only accessor.
        unsafe {
            let words = &*self.storage.words.get();
            std::slice::from_raw_parts(words.as_ptr() as *const u8, self.storage.byte_len)
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // Safety: as above, plus `&mut self` excludes other views via this guard.
        unsafe {
            let words = &mut *self.storage.words.get();
            std::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, self.storage.byte_len)
        }
    }

    /// Typed read view over the full buffer.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        self.check_element_type::<T>()?;
        // Safety: storage is u64-aligned and the lock guarantees exclusivity.
        unsafe {
            let words = &*self.storage.words.get();
            Ok(std::slice::from_raw_parts(
                words.as_ptr() as *const T,
                self.storage.byte_len / std::mem::size_of::<T>(),
            ))
        }
    }

    /// Typed write view over the full buffer.
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_element_type::<T>()?;
        // Safety: as above.
        unsafe {
            let words = &mut *self.storage.words.get();
            Ok(std::slice::from_raw_parts_mut(
                words.as_mut_ptr() as *mut T,
                self.storage.byte_len / std::mem::size_of::<T>(),
            ))
        }
    }

    /// Zero the full buffer.
    pub fn fill_zero(&mut self) {
        self.bytes_mut().fill(0);
    }

    fn check_element_type<T: Element>(&self) -> Result<()> {
        if T::ELEMENT_TYPE != self.tensor_type.element_type() {
            return Err(EdgeLmError::InvalidArgument(format!(
                "{} view of {} buffer",
                T::ELEMENT_TYPE,
                self.tensor_type.element_type()
            )));
        }
        Ok(())
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        self.storage.locked.store(false, Ordering::Release);
    }
}
