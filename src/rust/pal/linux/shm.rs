// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! POSIX named shared memory.
//!
//! Backs a shared region that the dataplane maps from another process. The creator owns the name and unlinks it on
//! drop; openers only unmap.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    ffi::CString,
    io,
    mem,
    ptr::{
        self,
        NonNull,
    },
    slice,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A mapped named shared memory object.
pub struct SharedMemory {
    name: CString,
    fd: libc::c_int,
    base: NonNull<u8>,
    len: usize,
    /// Did we create the object, and thus own its name?
    owner: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SharedMemory {
    /// Creates and maps a zero-filled object of `len` bytes. Fails with `EEXIST` if the name is taken.
    pub fn create(name: &str, len: usize) -> Result<Self, Fail> {
        let name: CString = c_name(name)?;
        let fd: libc::c_int = shm_open(&name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)?;
        // Safety: fd is an open shared memory object.
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } == -1 {
            let fail: Fail = last_error("create", "ftruncate");
            discard(&name, fd, true);
            return Err(fail);
        }
        Self::map(name, fd, len, true)
    }

    /// Maps the first `len` bytes of an existing object. Fails with `EINVAL` if the object is smaller.
    pub fn open(name: &str, len: usize) -> Result<Self, Fail> {
        let name: CString = c_name(name)?;
        let fd: libc::c_int = shm_open(&name, libc::O_RDWR)?;

        // Safety: stat is plain data and fd is open.
        let mut stat: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } == -1 {
            let fail: Fail = last_error("open", "fstat");
            discard(&name, fd, false);
            return Err(fail);
        }
        if (stat.st_size as usize) < len {
            let cause: String = format!("shared memory object too small (size={}, len={})", stat.st_size, len);
            error!("open(): {}", cause);
            discard(&name, fd, false);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        Self::map(name, fd, len, false)
    }

    fn map(name: CString, fd: libc::c_int, len: usize, owner: bool) -> Result<Self, Fail> {
        // Safety: fd is open and at least len bytes long.
        let addr: *mut libc::c_void = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        let base: NonNull<u8> = match NonNull::new(addr as *mut u8) {
            Some(base) if addr != libc::MAP_FAILED => base,
            _ => {
                let fail: Fail = last_error("map", "mmap");
                discard(&name, fd, owner);
                return Err(fail);
            },
        };

        // Descriptor vectors must not fault on the poll path. A tight memlock limit only costs latency.
        // Safety: the range was just mapped.
        if unsafe { libc::mlock(addr, len) } == -1 {
            warn!("map(): could not lock shared memory (name={:?}, len={})", name, len);
        }

        debug!("map(): name={:?} len={} owner={}", name, len, owner);
        Ok(Self {
            name,
            fd,
            base,
            len,
            owner,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the mapping.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: the mapping is len bytes long and lives as long as self.
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: the mapping is len bytes long and lives as long as self.
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn c_name(name: &str) -> Result<CString, Fail> {
    match CString::new(name) {
        Ok(name) => Ok(name),
        Err(_) => {
            let cause: String = format!("shared memory name contains a nul byte (name={:?})", name);
            error!("c_name(): {}", cause);
            Err(Fail::new(libc::EINVAL, &cause))
        },
    }
}

fn shm_open(name: &CString, flags: libc::c_int) -> Result<libc::c_int, Fail> {
    // Safety: name is nul-terminated.
    match unsafe { libc::shm_open(name.as_ptr(), flags, libc::S_IRUSR | libc::S_IWUSR) } {
        -1 => Err(last_error("shm_open", &format!("{:?}", name))),
        fd => Ok(fd),
    }
}

/// Converts the calling thread's errno into a failure.
fn last_error(function: &str, what: &str) -> Fail {
    let fail: Fail = Fail::from(io::Error::last_os_error());
    error!("{}(): {} failed ({})", function, what, fail.cause);
    fail
}

/// Closes `fd`, and unlinks `name` if we own it.
fn discard(name: &CString, fd: libc::c_int, owner: bool) {
    // Safety: fd is open and not used afterwards.
    if unsafe { libc::close(fd) } == -1 {
        warn!("discard(): close failed ({})", io::Error::last_os_error());
    }
    // Safety: name is nul-terminated.
    if owner && unsafe { libc::shm_unlink(name.as_ptr()) } == -1 {
        warn!("discard(): unlink failed ({})", io::Error::last_os_error());
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// The handle owns its mapping exclusively; moving it across threads moves that ownership.
unsafe impl Send for SharedMemory {}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        // Safety: the mapping is not referenced once self is gone.
        if unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) } == -1 {
            warn!("drop(): munmap failed ({})", io::Error::last_os_error());
        }
        discard(&self.name, self.fd, self.owner);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
