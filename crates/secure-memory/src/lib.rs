//! Minimal mlock/mprotect-backed storage for a single secret value.
//!
//! [`SecureBox`] allocates a fixed-size buffer, locks it so it is never paged
//! to swap, and zeroizes it on drop. It is intentionally narrow: one owned
//! value, initialized once through a closure, borrowed immutably after that.

use std::ops::Deref;

use zeroize::Zeroize;

#[derive(Debug)]
pub enum SecureMemoryError {
    Lock(String),
}

impl core::fmt::Display for SecureMemoryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SecureMemoryError::Lock(msg) => write!(f, "failed to lock secure memory: {msg}"),
        }
    }
}

impl std::error::Error for SecureMemoryError {}

/// Owns a `T` allocated in memory that is locked against swapping and
/// zeroized when dropped.
///
/// `T` is boxed first so its address is stable for the lifetime of the
/// `SecureBox`, then the backing page range is locked.
pub struct SecureBox<T: Zeroize> {
    inner: Box<T>,
}

impl<T: Zeroize + Default> SecureBox<T> {
    /// Allocate a zero-initialized `T`, lock its pages, then run `init` to
    /// fill it in.
    pub fn try_new<E>(init: impl FnOnce(&mut T) -> Result<(), E>) -> Result<Self, E>
    where
        E: From<SecureMemoryError>,
    {
        let mut inner = Box::new(T::default());
        lock(inner.as_mut() as *mut T as *mut u8, core::mem::size_of::<T>()).map_err(E::from)?;
        init(inner.as_mut())?;
        Ok(Self { inner })
    }

    pub fn borrow(&self) -> &T {
        &self.inner
    }
}

impl<T: Zeroize> Drop for SecureBox<T> {
    fn drop(&mut self) {
        self.inner.zeroize();
        let _ = unlock(self.inner.as_mut() as *mut T as *mut u8, core::mem::size_of::<T>());
    }
}

impl<T: Zeroize> Deref for SecureBox<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(unix)]
fn lock(ptr: *mut u8, len: usize) -> Result<(), SecureMemoryError> {
    // SAFETY: `ptr` points to `len` bytes owned by the caller for the
    // duration of this call; `mlock` only adjusts page residency.
    let rc = unsafe { libc::mlock(ptr.cast(), len) };
    if rc != 0 {
        return Err(SecureMemoryError::Lock(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}

#[cfg(unix)]
fn unlock(ptr: *mut u8, len: usize) -> Result<(), SecureMemoryError> {
    // SAFETY: same region previously locked by `lock`.
    let rc = unsafe { libc::munlock(ptr.cast(), len) };
    if rc != 0 {
        return Err(SecureMemoryError::Lock(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}

#[cfg(windows)]
fn lock(ptr: *mut u8, len: usize) -> Result<(), SecureMemoryError> {
    use windows::Win32::System::Memory::VirtualLock;
    // SAFETY: `ptr` points to `len` bytes owned by the caller for the
    // duration of this call.
    let ok = unsafe { VirtualLock(ptr.cast(), len) };
    if ok.is_err() {
        return Err(SecureMemoryError::Lock("VirtualLock failed".into()));
    }
    Ok(())
}

#[cfg(windows)]
fn unlock(ptr: *mut u8, len: usize) -> Result<(), SecureMemoryError> {
    use windows::Win32::System::Memory::VirtualUnlock;
    // SAFETY: same region previously locked by `lock`.
    let ok = unsafe { VirtualUnlock(ptr.cast(), len) };
    if ok.is_err() {
        return Err(SecureMemoryError::Lock("VirtualUnlock failed".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Zeroize)]
    struct Key([u8; 32]);

    #[test]
    fn roundtrip() {
        let secure = SecureBox::<Key>::try_new(|key| {
            key.0.fill(0x42);
            Ok::<_, SecureMemoryError>(())
        })
        .expect("lock should succeed");
        assert_eq!(secure.borrow().0, [0x42; 32]);
    }
}
