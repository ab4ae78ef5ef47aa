//! The null-terminated arrays of NUL-terminated strings consumed by exec.

use crate::common::{assert_send, assert_sync};
use std::ffi::{c_char, CStr, CString, NulError, OsStr};
use std::marker::PhantomData;
use std::os::unix::ffi::OsStrExt;
use std::pin::Pin;
use std::ptr;

/// Given a list of strings, construct a vector of pointers to those strings contents.
struct NullTerminatedArray<'p> {
    pointers: Box<[*const c_char]>,
    _phantom: PhantomData<&'p CStr>,
}

impl<'p> NullTerminatedArray<'p> {
    /// Return the list of pointers, appropriate for envp or argv.
    /// We freely give out mutable pointers even though we are not mut, because exec and
    /// posix_spawn take arrays of mutable pointers without mutating them.
    fn get(&self) -> *mut *const c_char {
        debug_assert!(
            self.pointers.last().is_some_and(|p| p.is_null()),
            "Should have null terminator"
        );
        self.pointers.as_ptr().cast_mut()
    }

    /// Construct from a list of "strings".
    /// This holds pointers into the strings.
    fn new<S: AsRef<CStr>>(strs: &'p [S]) -> Self {
        let mut pointers = Vec::with_capacity(1 + strs.len());
        for s in strs {
            pointers.push(s.as_ref().as_ptr());
        }
        pointers.push(ptr::null());
        NullTerminatedArray {
            pointers: pointers.into_boxed_slice(),
            _phantom: PhantomData,
        }
    }
}

/// Safety: NullTerminatedArray is Send and Sync because it's immutable.
unsafe impl Send for NullTerminatedArray<'_> {}
unsafe impl Sync for NullTerminatedArray<'_> {}

/// A container which exposes a null-terminated array of pointers to strings that it owns.
/// Everything is allocated before fork, so the child only reads it.
pub struct OwningNullTerminatedArray {
    // Note that null_terminated_array holds pointers into our boxed strings.
    // The 'static is a lie.
    strings: Pin<Box<[CString]>>,
    null_terminated_array: NullTerminatedArray<'static>,
}

const _: () = assert_send::<OwningNullTerminatedArray>();
const _: () = assert_sync::<OwningNullTerminatedArray>();

impl OwningNullTerminatedArray {
    pub fn get(&self) -> *mut *const c_char {
        self.null_terminated_array.get()
    }
    pub fn get_mut(&self) -> *mut *mut c_char {
        self.get().cast()
    }

    /// Construct, taking ownership of a list of strings.
    pub fn new(strs: Vec<CString>) -> Self {
        let strings = strs.into_boxed_slice();
        // Safety: we're pinning the strings, so they won't move.
        let string_slice: &'static [CString] = unsafe { std::mem::transmute(&*strings) };
        OwningNullTerminatedArray {
            strings: Pin::from(strings),
            null_terminated_array: NullTerminatedArray::new(string_slice),
        }
    }

    /// Construct from OS strings, such as a command's argv.
    /// Fails if any string contains an interior NUL.
    pub fn from_os_strs<I, S>(strs: I) -> Result<Self, NulError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let strings = strs
            .into_iter()
            .map(|s| CString::new(s.as_ref().as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(strings))
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }
    pub fn iter(&self) -> impl Iterator<Item = &CString> {
        self.strings.iter()
    }
}
