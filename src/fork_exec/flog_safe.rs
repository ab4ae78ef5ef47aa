//! Logging which may be used between fork() and exec().

use std::ffi::CStr;
use std::mem::MaybeUninit;

/// Storage for formatting an int without allocating.
/// 12 bytes holds any i32 including its sign.
type StackBuffer = MaybeUninit<[u8; 12]>;

fn format_i32(buff: &mut StackBuffer, val: i32) -> &[u8] {
    if val == 0 {
        return b"0";
    }
    let buff: &mut [u8; 12] = buff.write([0; 12]);
    let mut magnitude = val.unsigned_abs();
    // Fill from the end so no reversal is needed.
    let mut cursor = buff.len();
    while magnitude != 0 {
        cursor -= 1;
        buff[cursor] = b'0' + (magnitude % 10) as u8;
        magnitude /= 10;
    }
    if val < 0 {
        cursor -= 1;
        buff[cursor] = b'-';
    }
    &buff[cursor..]
}

/// A value which can be logged from an async-signal-safe context.
/// Bytes are assumed UTF-8; only pass ASCII string literals here.
pub trait FloggableDisplayAsyncSafe {
    /// Return the bytes to write, optionally formatting into `storage`.
    /// This must not panic or allocate.
    fn to_flog_str_async_safe<'a>(&'a self, storage: &'a mut StackBuffer) -> &'a [u8];
}

impl FloggableDisplayAsyncSafe for &str {
    fn to_flog_str_async_safe(&self, _storage: &mut StackBuffer) -> &[u8] {
        self.as_bytes()
    }
}

impl FloggableDisplayAsyncSafe for i32 {
    fn to_flog_str_async_safe<'a>(&'a self, storage: &'a mut StackBuffer) -> &'a [u8] {
        format_i32(storage, *self)
    }
}

impl FloggableDisplayAsyncSafe for &CStr {
    fn to_flog_str_async_safe<'a>(&'a self, _storage: &'a mut StackBuffer) -> &'a [u8] {
        self.to_bytes()
    }
}

/// Write one value to `fd` without allocating or taking locks.
pub fn flog_impl_async_safe(fd: i32, s: impl FloggableDisplayAsyncSafe) {
    if fd < 0 {
        return;
    }
    let mut storage = StackBuffer::uninit();
    let bytes: &[u8] = s.to_flog_str_async_safe(&mut storage);
    // Note we deliberately do not retry on signals, etc.
    unsafe {
        let _ = libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len());
    }
}

/// Variant of FLOG which is async-safe to use after fork().
/// Only str, i32 and C strings are supported.
/// The arguments are NOT space-separated. Embed real spaces in your literals.
macro_rules! FLOG_SAFE {
    ($category:ident, $($elem:expr),+ $(,)*) => {
        if crate::flog::categories::$category
            .enabled
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            #[allow(unused_imports)]
            use crate::fork_exec::flog_safe::{flog_impl_async_safe, FloggableDisplayAsyncSafe};
            let fd = crate::flog::get_flog_file_fd();
            flog_impl_async_safe(fd, stringify!($category));
            flog_impl_async_safe(fd, ": ");
            $(
                flog_impl_async_safe(fd, $elem);
            )+
            // We always append a newline.
            flog_impl_async_safe(fd, "\n");
        }
    };
}

pub(crate) use FLOG_SAFE;
