use {crate::utils::oserror::OsError, std::ptr, uapi::c};

/// A shared read/write mapping that is unmapped on drop.
pub struct Mmapped {
    ptr: *mut u8,
    len: usize,
}

pub fn mmap(fd: c::c_int, len: usize, offset: c::off_t) -> Result<Mmapped, OsError> {
    let res = unsafe {
        c::mmap(
            ptr::null_mut(),
            len,
            c::PROT_READ | c::PROT_WRITE,
            c::MAP_SHARED,
            fd,
            offset,
        )
    };
    if res == c::MAP_FAILED {
        Err(OsError::default())
    } else {
        Ok(Mmapped {
            ptr: res.cast(),
            len,
        })
    }
}

impl Mmapped {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for Mmapped {
    fn drop(&mut self) {
        unsafe {
            c::munmap(self.ptr.cast(), self.len);
        }
    }
}
