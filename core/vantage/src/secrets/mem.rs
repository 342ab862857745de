//! Wipeable memory for secret material.
//!
//! Two storage strategies share one type: on Unix the buffer is locked into
//! RAM with `mlock` so secret bytes never reach swap, and on other platforms
//! (or with the `unprotected-secrets` feature) it is a plain heap buffer.
//! Either way the contents are zeroized before the memory is released.
//! Callers depend only on `bytes`/`replace`/`wipe`.

use zeroize::Zeroize;

#[derive(Debug, Default)]
pub(crate) struct SecretBuffer {
    data: Vec<u8>,
    locked: bool,
}

impl SecretBuffer {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        let locked = lock_memory(&data);
        SecretBuffer { data, locked }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Wipes the current contents and installs `new` in their place.
    pub(crate) fn replace(&mut self, new: Vec<u8>) {
        self.wipe();
        *self = SecretBuffer::new(new);
    }

    /// Makes a protected copy of the contents.
    pub(crate) fn duplicate(&self) -> SecretBuffer {
        SecretBuffer::new(self.data.clone())
    }

    /// Zeroizes and releases the buffer. Safe to call more than once.
    pub(crate) fn wipe(&mut self) {
        if self.locked {
            unlock_memory(&self.data);
            self.locked = false;
        }
        self.data.zeroize();
        self.data = Vec::new();
    }
}

impl Drop for SecretBuffer {
    fn drop(&mut self) {
        self.wipe();
    }
}

#[cfg(all(unix, not(feature = "unprotected-secrets")))]
fn lock_memory(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    let ret = unsafe { libc::mlock(data.as_ptr().cast::<libc::c_void>(), data.len()) };
    if ret != 0 {
        // RLIMIT_MEMLOCK may be exhausted; the secret still works, it is
        // just not pinned in RAM.
        log::warn!("failed to lock secret memory, value may be swapped out");
    }
    ret == 0
}

#[cfg(all(unix, not(feature = "unprotected-secrets")))]
fn unlock_memory(data: &[u8]) {
    if !data.is_empty() {
        unsafe {
            libc::munlock(data.as_ptr().cast::<libc::c_void>(), data.len());
        }
    }
}

#[cfg(not(all(unix, not(feature = "unprotected-secrets"))))]
fn lock_memory(_data: &[u8]) -> bool {
    false
}

#[cfg(not(all(unix, not(feature = "unprotected-secrets"))))]
fn unlock_memory(_data: &[u8]) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wipe_is_idempotent() {
        let mut buf = SecretBuffer::new(b"hunter2".to_vec());
        assert_eq!(buf.bytes(), b"hunter2");
        buf.wipe();
        assert!(buf.is_empty());
        buf.wipe();
        assert!(buf.is_empty());
    }

    #[test]
    fn replace_swaps_contents() {
        let mut buf = SecretBuffer::new(b"old".to_vec());
        buf.replace(b"new".to_vec());
        assert_eq!(buf.bytes(), b"new");
    }

    #[test]
    fn duplicate_is_independent() {
        let mut buf = SecretBuffer::new(b"value".to_vec());
        let copy = buf.duplicate();
        buf.wipe();
        assert_eq!(copy.bytes(), b"value");
    }
}
