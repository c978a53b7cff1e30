use std::marker::PhantomData;

use parking_lot::{Mutex, RwLock};

use crate::{KResult, KernelError};

/// Fixed-width values that can cross the guest/host boundary byte-exactly.
/// Guest memory is little-endian.
pub trait Scalar: Copy {
    const SIZE: usize;
    fn from_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut [u8]);
}

macro_rules! impl_scalar {
    ($($t:ty),* $(,)?) => {$(
        impl Scalar for $t {
            const SIZE: usize = size_of::<$t>();

            fn from_le(bytes: &[u8]) -> Self {
                Self::from_le_bytes(bytes.try_into().expect("scalar width"))
            }

            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64);

/// Flat byte-addressable guest memory covering `[base, base + len)`.
///
/// Reads and writes are bounds-checked and side-effect free on failure.
/// Allocation is a bump arena; `dealloc` only keeps the books (objects are
/// process-lifetime, matching how the emulated kernel treats its arenas).
#[derive(Debug)]
pub struct GuestMemory {
    base: u32,
    data: RwLock<Vec<u8>>,
    brk: Mutex<u32>,
}

impl GuestMemory {
    #[must_use]
    pub fn new(base: u32, len: u32) -> Self {
        Self {
            base,
            data: RwLock::new(vec![0; len as usize]),
            brk: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn base(&self) -> u32 {
        self.base
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.data.read().len() as u32
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn offset(&self, addr: u32, len: usize) -> KResult<usize> {
        let off = addr.wrapping_sub(self.base) as usize;
        let end = off.checked_add(len).ok_or(KernelError::IllegalAddress)?;
        if addr < self.base || end > self.data.read().len() {
            return Err(KernelError::IllegalAddress);
        }
        Ok(off)
    }

    pub fn read<T: Scalar>(&self, addr: u32) -> KResult<T> {
        let off = self.offset(addr, T::SIZE)?;
        let data = self.data.read();
        Ok(T::from_le(&data[off..off + T::SIZE]))
    }

    pub fn write<T: Scalar>(&self, addr: u32, value: T) -> KResult<()> {
        let off = self.offset(addr, T::SIZE)?;
        let mut data = self.data.write();
        value.write_le(&mut data[off..off + T::SIZE]);
        Ok(())
    }

    pub fn read_bytes(&self, addr: u32, out: &mut [u8]) -> KResult<()> {
        let off = self.offset(addr, out.len())?;
        let data = self.data.read();
        out.copy_from_slice(&data[off..off + out.len()]);
        Ok(())
    }

    pub fn write_bytes(&self, addr: u32, bytes: &[u8]) -> KResult<()> {
        let off = self.offset(addr, bytes.len())?;
        let mut data = self.data.write();
        data[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Bump-allocates `len` bytes with the given power-of-two alignment and
    /// returns the guest address of the block.
    pub fn alloc(&self, len: u32, align: u32) -> KResult<u32> {
        debug_assert!(align.is_power_of_two());
        let mut brk = self.brk.lock();
        let start = brk
            .checked_add(align - 1)
            .ok_or(KernelError::NoMemory)?
            & !(align - 1);
        let end = start.checked_add(len).ok_or(KernelError::NoMemory)?;
        if end as usize > self.data.read().len() {
            return Err(KernelError::NoMemory);
        }
        *brk = end;
        Ok(self.base + start)
    }

    pub fn dealloc(&self, _addr: u32) {
        // Arena-backed: individual blocks are not reclaimed.
    }
}

/// Typed 32-bit guest pointer. Null is address zero, as in the guest ABI.
pub struct GuestPtr<T> {
    addr: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for GuestPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for GuestPtr<T> {}

impl<T> std::fmt::Debug for GuestPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GuestPtr({:#010x})", self.addr)
    }
}

impl<T> PartialEq for GuestPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl<T> Eq for GuestPtr<T> {}

impl<T> GuestPtr<T> {
    #[must_use]
    pub fn new(addr: u32) -> Self {
        Self {
            addr,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn null() -> Self {
        Self::new(0)
    }

    #[must_use]
    pub fn addr(self) -> u32 {
        self.addr
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.addr == 0
    }
}

impl<T: Scalar> GuestPtr<T> {
    pub fn read(self, mem: &GuestMemory) -> KResult<T> {
        mem.read(self.addr)
    }

    pub fn write(self, mem: &GuestMemory, value: T) -> KResult<()> {
        mem.write(self.addr, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip_is_byte_exact() {
        let mem = GuestMemory::new(0x8000_0000, 0x1000);

        mem.write::<u32>(0x8000_0010, 0xdead_beef).unwrap();
        assert_eq!(mem.read::<u32>(0x8000_0010).unwrap(), 0xdead_beef);

        mem.write::<u64>(0x8000_0020, 0x0123_4567_89ab_cdef).unwrap();
        assert_eq!(mem.read::<u64>(0x8000_0020).unwrap(), 0x0123_4567_89ab_cdef);
        // Little-endian layout is observable byte by byte.
        assert_eq!(mem.read::<u8>(0x8000_0020).unwrap(), 0xef);
        assert_eq!(mem.read::<u8>(0x8000_0027).unwrap(), 0x01);

        mem.write::<i16>(0x8000_0030, -2).unwrap();
        assert_eq!(mem.read::<i16>(0x8000_0030).unwrap(), -2);
    }

    #[test]
    fn out_of_range_access_fails_without_side_effects() {
        let mem = GuestMemory::new(0x8000_0000, 0x100);

        assert_eq!(
            mem.read::<u32>(0x7fff_ffff),
            Err(KernelError::IllegalAddress)
        );
        assert_eq!(
            mem.write::<u32>(0x8000_00fe, 1),
            Err(KernelError::IllegalAddress)
        );
        // The straddling write above must not have touched the last bytes.
        assert_eq!(mem.read::<u16>(0x8000_00fe).unwrap(), 0);
    }

    #[test]
    fn alloc_respects_alignment_and_exhausts() {
        let mem = GuestMemory::new(0x8100_0000, 0x100);

        let a = mem.alloc(3, 4).unwrap();
        let b = mem.alloc(8, 8).unwrap();
        assert_eq!(a % 4, 0);
        assert_eq!(b % 8, 0);
        assert!(b >= a + 3);

        assert_eq!(mem.alloc(0x1000, 4), Err(KernelError::NoMemory));
    }

    #[test]
    fn guest_ptr_reads_and_writes_through_memory() {
        let mem = GuestMemory::new(0, 0x100);
        let p: GuestPtr<u32> = GuestPtr::new(0x40);

        p.write(&mem, 77).unwrap();
        assert_eq!(p.read(&mem).unwrap(), 77);
        assert!(GuestPtr::<u32>::null().is_null());
    }
}
