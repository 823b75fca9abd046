// The MIT License (MIT)

// Copyright (c) 2015 Rustcc Developers

//  Permission is hereby granted, free of charge, to any person obtaining a
//  copy of this software and associated documentation files (the "Software"),
//  to deal in the Software without restriction, including without limitation
//  the rights to use, copy, modify, merge, publish, distribute, sublicense,
//  and/or sell copies of the Software, and to permit persons to whom the
//  Software is furnished to do so, subject to the following conditions:
//
//  The above copyright notice and this permission notice shall be included in
//  all copies or substantial portions of the Software.
//
//  THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
//  OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//  FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//  AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//  LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
//  FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
//  DEALINGS IN THE SOFTWARE.

use std::fmt;
use std::io;
use std::ptr;

use crate::sys;

/// A coroutine's stack: an anonymous mapping with the lowest page protected
/// as a guard page. The stack grows from the high end down toward the guard.
pub struct Stack {
    base: *mut libc::c_void,
    total: usize,
    size: usize,
}

unsafe impl Send for Stack {}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Stack {{ base: {:#x}, size: {} }}", self.base as usize, self.size)
    }
}

static STACK_FLAGS: libc::c_int = libc::MAP_STACK | libc::MAP_PRIVATE | libc::MAP_ANON;

impl Stack {
    /// Allocate a new stack of at least `size` usable bytes.
    ///
    /// There is not much sensible to do when the mapping fails, so this
    /// panics, like thread spawning does on resource exhaustion.
    pub fn new(size: usize) -> Stack {
        let page = sys::page_size();
        let usable = round_up(size.max(page), page);
        let total = usable + page;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                STACK_FLAGS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            panic!(
                "mmap for stack of size {} failed: {}",
                total,
                io::Error::last_os_error()
            );
        }

        // The start of the mapping is the *last* page reachable by the stack,
        // since it grows downward. Revoking access there catches overflows.
        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            unsafe {
                libc::munmap(base, total);
            }
            panic!(
                "could not protect stack guard page: {}",
                io::Error::last_os_error()
            );
        }

        Stack {
            base,
            total,
            size: usable,
        }
    }

    /// Lowest usable address, just above the guard page.
    pub fn bottom(&self) -> *mut libc::c_void {
        unsafe { self.base.add(self.total - self.size) }
    }

    /// Usable size in bytes.
    pub fn len(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.total);
        }
    }
}

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) / to * to
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stack_is_writable() {
        let stack = Stack::new(16 * 1024);
        assert!(stack.len() >= 16 * 1024);
        unsafe {
            // Touch the first and last usable bytes.
            let lo = stack.bottom() as *mut u8;
            *lo = 0xAA;
            let hi = lo.add(stack.len() - 1);
            *hi = 0xBB;
            assert_eq!(*lo, 0xAA);
            assert_eq!(*hi, 0xBB);
        }
    }
}
