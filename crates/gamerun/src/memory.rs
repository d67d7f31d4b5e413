//! # Memory Marshaler
//!
//! The single choke point for bytes crossing into or out of guest linear
//! memory. Every bridge call goes through the same primitives:
//! allocate → write/read → free.
//!
//! ## Invariants
//!
//! - **Fresh base**: no host address is cached. Every access goes through
//!   `Memory::read`/`Memory::write`/`Memory::data` with the current store, so
//!   growth of the guest memory between calls cannot leave a stale base.
//! - **Owned release**: [`GuestBuffer`] is not `Clone` and [`Marshaler::free`]
//!   consumes it. The live-handle arena catches the remaining ways to
//!   double-free (a handle adopted twice, a handle released by number).
//!
//! Guest exports used: `memoryAllocateBytes`, `memoryBytesOffset`,
//! `memoryBytesLen`, `memoryFreeBytes` and `memory`.

use std::collections::HashSet;

use wasmtime::AsContext;
use wasmtime::AsContextMut;
use wasmtime::Instance;
use wasmtime::Memory;
use wasmtime::StoreContext;
use wasmtime::TypedFunc;

use crate::fault::ProtocolViolation;

#[derive(Debug)]
pub enum Error {
    Violation(ProtocolViolation),
    /// The guest allocator (or another memory export) trapped.
    Guest(wasmtime::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Violation(v) => write!(f, "Protocol violation: {}", v),
            Self::Guest(e) => write!(f, "Guest memory call failed: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<ProtocolViolation> for Error {
    fn from(v: ProtocolViolation) -> Self {
        Self::Violation(v)
    }
}

impl From<wasmtime::Error> for Error {
    fn from(e: wasmtime::Error) -> Self {
        Self::Guest(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A byte buffer living in guest memory, owned by the host until freed.
#[derive(Debug, PartialEq, Eq)]
pub struct GuestBuffer {
    handle: u32,
    offset: usize,
    len: usize,
}

impl GuestBuffer {
    /// The guest-side handle, as passed to guest exports.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Allocation bookkeeping, used to check that every bridge call releases
/// everything it obtained.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Buffers obtained, by host allocation or adoption of a guest result.
    pub obtained: u64,
    pub freed: u64,
    pub live: usize,
}

pub struct Marshaler {
    memory: Memory,
    allocate_bytes: TypedFunc<u32, u32>,
    bytes_offset: TypedFunc<u32, u32>,
    bytes_len: TypedFunc<u32, u32>,
    free_bytes: TypedFunc<u32, ()>,
    live: HashSet<u32>,
    obtained: u64,
    freed: u64,
}

impl Marshaler {
    /// Resolves the memory exports of an instantiated guest.
    pub fn new(mut store: impl AsContextMut, instance: &Instance) -> wasmtime::Result<Self> {
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| wasmtime::Error::msg("guest does not export 'memory'"))?;
        Ok(Self {
            memory,
            allocate_bytes: instance.get_typed_func(&mut store, "memoryAllocateBytes")?,
            bytes_offset: instance.get_typed_func(&mut store, "memoryBytesOffset")?,
            bytes_len: instance.get_typed_func(&mut store, "memoryBytesLen")?,
            free_bytes: instance.get_typed_func(&mut store, "memoryFreeBytes")?,
            live: HashSet::new(),
            obtained: 0,
            freed: 0,
        })
    }

    pub fn memory(&self) -> Memory {
        self.memory
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            obtained: self.obtained,
            freed: self.freed,
            live: self.live.len(),
        }
    }

    /// Reserves `len` bytes in guest memory. The caller must `free` the result.
    pub fn allocate(&mut self, mut store: impl AsContextMut, len: usize) -> Result<GuestBuffer> {
        let requested = u32::try_from(len).map_err(|_| ProtocolViolation::OutOfBounds { offset: 0, len })?;
        let handle = self.allocate_bytes.call(&mut store, requested)?;
        let buffer = self.adopt(&mut store, handle)?;
        if buffer.len != len {
            let actual = buffer.len;
            self.free(&mut store, buffer)?;
            return Err(ProtocolViolation::LengthMismatch { expected: len, actual }.into());
        }
        tracing::trace!(handle, len, "allocated guest buffer");
        Ok(buffer)
    }

    /// Takes ownership of a buffer the guest produced.
    /// The handle becomes live only after the guest has described it.
    pub fn adopt(&mut self, mut store: impl AsContextMut, handle: u32) -> Result<GuestBuffer> {
        if self.live.contains(&handle) {
            return Err(violation(ProtocolViolation::AliasedBuffer { handle }));
        }
        let offset = self.bytes_offset.call(&mut store, handle)? as usize;
        let len = self.bytes_len.call(&mut store, handle)? as usize;
        self.live.insert(handle);
        self.obtained += 1;
        Ok(GuestBuffer { handle, offset, len })
    }

    /// Copies `bytes` into `buffer`. Lengths must match exactly.
    pub fn write(&self, mut store: impl AsContextMut, buffer: &GuestBuffer, bytes: &[u8]) -> Result<()> {
        self.ensure_live(buffer)?;
        if bytes.len() != buffer.len {
            return Err(ProtocolViolation::LengthMismatch {
                expected: buffer.len,
                actual: bytes.len(),
            }
            .into());
        }
        self.memory
            .write(&mut store, buffer.offset, bytes)
            .map_err(|_| out_of_bounds(buffer.offset, buffer.len))?;
        Ok(())
    }

    /// Snapshots the current contents of `buffer`.
    pub fn read(&self, store: impl AsContext, buffer: &GuestBuffer) -> Result<Vec<u8>> {
        self.ensure_live(buffer)?;
        let mut bytes = vec![0; buffer.len];
        self.memory
            .read(&store, buffer.offset, &mut bytes)
            .map_err(|_| out_of_bounds(buffer.offset, buffer.len))?;
        Ok(bytes)
    }

    /// Releases `buffer` in the guest.
    pub fn free(&mut self, mut store: impl AsContextMut, buffer: GuestBuffer) -> Result<()> {
        if !self.live.remove(&buffer.handle) {
            return Err(violation(ProtocolViolation::DoubleFree { handle: buffer.handle }));
        }
        self.freed += 1;
        self.free_bytes.call(&mut store, buffer.handle)?;
        tracing::trace!(handle = buffer.handle, "freed guest buffer");
        Ok(())
    }

    /// Allocates a buffer holding a copy of `bytes`.
    ///
    /// If the copy fails the fresh allocation is released before returning.
    pub fn create(&mut self, mut store: impl AsContextMut, bytes: &[u8]) -> Result<GuestBuffer> {
        let buffer = self.allocate(&mut store, bytes.len())?;
        if let Err(e) = self.write(&mut store, &buffer, bytes) {
            self.free(&mut store, buffer)?;
            return Err(e);
        }
        Ok(buffer)
    }

    /// Adopts, reads and frees a guest-produced buffer.
    ///
    /// The free happens whether or not the read succeeded.
    pub fn take(&mut self, mut store: impl AsContextMut, handle: u32) -> Result<Vec<u8>> {
        let buffer = self.adopt(&mut store, handle)?;
        let bytes = self.read(&store, &buffer);
        let freed = self.free(&mut store, buffer);
        let bytes = bytes?;
        freed?;
        Ok(bytes)
    }

    fn ensure_live(&self, buffer: &GuestBuffer) -> Result<()> {
        if self.live.contains(&buffer.handle) {
            Ok(())
        } else {
            Err(violation(ProtocolViolation::UnknownBuffer { handle: buffer.handle }))
        }
    }
}

/// Borrows `len` bytes at `offset` from guest memory, resolving the base now.
///
/// Used by capability calls, which receive raw (offset, len) pairs rather
/// than buffer handles.
pub fn region<'a, T: 'static>(
    memory: &Memory,
    store: impl Into<StoreContext<'a, T>>,
    offset: u32,
    len: u32,
) -> std::result::Result<&'a [u8], ProtocolViolation> {
    let (offset, len) = (offset as usize, len as usize);
    memory
        .data(store)
        .get(offset..offset.saturating_add(len))
        .ok_or(ProtocolViolation::OutOfBounds { offset, len })
}

/// Writes `bytes` at `offset` in guest memory, resolving the base now.
pub fn write_region(
    memory: &Memory,
    store: impl AsContextMut,
    offset: u32,
    bytes: &[u8],
) -> std::result::Result<(), ProtocolViolation> {
    memory
        .write(store, offset as usize, bytes)
        .map_err(|_| ProtocolViolation::OutOfBounds {
            offset: offset as usize,
            len: bytes.len(),
        })
}

fn out_of_bounds(offset: usize, len: usize) -> Error {
    violation(ProtocolViolation::OutOfBounds { offset, len })
}

fn violation(v: ProtocolViolation) -> Error {
    tracing::error!(violation = %v, "guest memory protocol violation");
    Error::Violation(v)
}

#[cfg(test)]
mod tests {
    use wasmtime::Engine;
    use wasmtime::Module;
    use wasmtime::Store;

    use super::*;

    /// Bump allocator with an 8-byte `[offset, len]` header per handle.
    /// Three-byte requests are answered with four bytes, handle 8 traps on
    /// lookup and handle 16 points past the end of memory.
    const GUEST: &str = r#"
        (module
          (memory (export "memory") 1)
          (global $heap (mut i32) (i32.const 1024))
          (global $freed (mut i32) (i32.const 0))
          (data (i32.const 16) "\00\00\10\00\04\00\00\00")

          (func (export "memoryAllocateBytes") (param $len i32) (result i32)
            (local $h i32)
            (local.set $h (global.get $heap))
            (if (i32.eq (local.get $len) (i32.const 3))
              (then (local.set $len (i32.const 4))))
            (i32.store (local.get $h) (i32.add (local.get $h) (i32.const 8)))
            (i32.store offset=4 (local.get $h) (local.get $len))
            (global.set $heap
              (i32.add (local.get $h)
                (i32.and (i32.add (local.get $len) (i32.const 15)) (i32.const -8))))
            (local.get $h))

          (func (export "memoryBytesOffset") (param $h i32) (result i32)
            (if (i32.eq (local.get $h) (i32.const 8))
              (then unreachable))
            (i32.load (local.get $h)))

          (func (export "memoryBytesLen") (param $h i32) (result i32)
            (i32.load offset=4 (local.get $h)))

          (func (export "memoryFreeBytes") (param $h i32)
            (global.set $freed (i32.add (global.get $freed) (i32.const 1))))

          (func (export "freed") (result i32)
            (global.get $freed)))
    "#;

    struct Guest {
        store: Store<()>,
        instance: Instance,
        marshaler: Marshaler,
    }

    impl Guest {
        fn new() -> Self {
            let engine = Engine::default();
            let module = Module::new(&engine, GUEST).unwrap();
            let mut store = Store::new(&engine, ());
            let instance = Instance::new(&mut store, &module, &[]).unwrap();
            let marshaler = Marshaler::new(&mut store, &instance).unwrap();
            Self {
                store,
                instance,
                marshaler,
            }
        }

        /// How many times the guest's free export ran.
        fn guest_frees(&mut self) -> u32 {
            self.instance
                .get_typed_func::<(), u32>(&mut self.store, "freed")
                .unwrap()
                .call(&mut self.store, ())
                .unwrap()
        }
    }

    fn violation_of<T: std::fmt::Debug>(result: Result<T>) -> ProtocolViolation {
        match result {
            Err(Error::Violation(v)) => v,
            other => panic!("expected a protocol violation, got {:?}", other),
        }
    }

    #[test]
    fn create_read_free_balances() {
        let mut guest = Guest::new();
        let buffer = guest.marshaler.create(&mut guest.store, b"abcd").unwrap();
        assert_eq!(guest.marshaler.read(&guest.store, &buffer).unwrap(), b"abcd".to_vec());
        guest.marshaler.free(&mut guest.store, buffer).unwrap();

        assert_eq!(
            guest.marshaler.stats(),
            BufferStats {
                obtained: 1,
                freed: 1,
                live: 0
            }
        );
        assert_eq!(guest.guest_frees(), 1);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut guest = Guest::new();
        let buffer = guest.marshaler.create(&mut guest.store, b"xy").unwrap();
        let (handle, offset) = (buffer.handle, buffer.offset);
        guest.marshaler.free(&mut guest.store, buffer).unwrap();

        let stale = GuestBuffer { handle, offset, len: 2 };
        assert_eq!(
            violation_of(guest.marshaler.read(&guest.store, &stale)),
            ProtocolViolation::UnknownBuffer { handle }
        );
        assert_eq!(
            violation_of(guest.marshaler.write(&mut guest.store, &stale, b"zz")),
            ProtocolViolation::UnknownBuffer { handle }
        );
        assert_eq!(
            violation_of(guest.marshaler.free(&mut guest.store, stale)),
            ProtocolViolation::DoubleFree { handle }
        );
        // The guest never saw the second free.
        assert_eq!(guest.guest_frees(), 1);
    }

    #[test]
    fn adopting_a_live_handle_is_rejected() {
        let mut guest = Guest::new();
        let buffer = guest.marshaler.allocate(&mut guest.store, 4).unwrap();
        let handle = buffer.handle();
        assert_eq!(
            violation_of(guest.marshaler.adopt(&mut guest.store, handle)),
            ProtocolViolation::AliasedBuffer { handle }
        );
        assert_eq!(guest.marshaler.stats().live, 1);
        guest.marshaler.free(&mut guest.store, buffer).unwrap();
        assert_eq!(guest.marshaler.stats().live, 0);
    }

    #[test]
    fn write_must_match_buffer_length() {
        let mut guest = Guest::new();
        let buffer = guest.marshaler.allocate(&mut guest.store, 4).unwrap();
        assert_eq!(
            violation_of(guest.marshaler.write(&mut guest.store, &buffer, b"abc")),
            ProtocolViolation::LengthMismatch { expected: 4, actual: 3 }
        );
        guest.marshaler.free(&mut guest.store, buffer).unwrap();
    }

    #[test]
    fn short_changed_allocation_is_released() {
        let mut guest = Guest::new();
        assert_eq!(
            violation_of(guest.marshaler.allocate(&mut guest.store, 3)),
            ProtocolViolation::LengthMismatch { expected: 3, actual: 4 }
        );
        assert_eq!(
            guest.marshaler.stats(),
            BufferStats {
                obtained: 1,
                freed: 1,
                live: 0
            }
        );
        assert_eq!(guest.guest_frees(), 1);
    }

    #[test]
    fn trap_while_adopting_leaves_nothing_live() {
        let mut guest = Guest::new();
        let result = guest.marshaler.adopt(&mut guest.store, 8);
        assert!(matches!(result, Err(Error::Guest(_))));
        assert_eq!(guest.marshaler.stats(), BufferStats::default());
    }

    #[test]
    fn take_frees_even_when_the_read_fails() {
        let mut guest = Guest::new();
        assert_eq!(
            violation_of(guest.marshaler.take(&mut guest.store, 16)),
            ProtocolViolation::OutOfBounds {
                offset: 0x10_0000,
                len: 4
            }
        );
        assert_eq!(guest.marshaler.stats().live, 0);
        assert_eq!(guest.guest_frees(), 1);
    }

    #[test]
    fn regions_are_bounds_checked() {
        let mut guest = Guest::new();
        let memory = guest.marshaler.memory();
        assert_eq!(region(&memory, &guest.store, 16, 4).unwrap(), &[0, 0, 0x10, 0]);
        assert_eq!(
            region(&memory, &guest.store, 65_534, 4).unwrap_err(),
            ProtocolViolation::OutOfBounds { offset: 65_534, len: 4 }
        );
        assert_eq!(
            write_region(&memory, &mut guest.store, 65_535, &[1, 2]).unwrap_err(),
            ProtocolViolation::OutOfBounds { offset: 65_535, len: 2 }
        );
        write_region(&memory, &mut guest.store, 65_534, &[1, 2]).unwrap();
    }
}
