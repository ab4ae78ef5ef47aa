//! This file supports specifying and applying redirections.

use crate::io::{IoChain, IoDataRef};
use std::os::fd::RawFd;

/// The redirections currently in effect for a context, in push order.
/// Later entries for the same fd shadow earlier ones.
#[derive(Clone, Default, Debug)]
pub struct RedirectionStack {
    entries: IoChain,
}

impl RedirectionStack {
    pub fn new() -> Self {
        Default::default()
    }

    /// Append an override.
    pub fn push(&mut self, io: IoDataRef) {
        self.entries.push(io);
    }

    /// Remove the most recent override.
    pub fn pop(&mut self) -> Option<IoDataRef> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return the redirections to hand to a spawn. Entries are kept in push order, since an fd
    /// redirection refers to whatever its source meant when it was pushed; resolving the chain
    /// into dup2 actions gives last-write-wins per fd.
    pub fn materialize(&self) -> IoChain {
        self.entries.clone()
    }
}

impl From<IoChain> for RedirectionStack {
    fn from(entries: IoChain) -> Self {
        RedirectionStack { entries }
    }
}

/// A type that represents the action dup2(src, target).
/// If target is negative, this represents close(src).
/// Note none of the fds here are considered 'owned'.
#[derive(Clone, Copy, Debug)]
pub struct Dup2Action {
    pub src: i32,
    pub target: i32,
}

/// A class representing a sequence of basic redirections.
#[derive(Default, Debug)]
pub struct Dup2List {
    /// The list of actions.
    pub actions: Vec<Dup2Action>,
}

/// Produce a Dup2List from an io chain. This may not be called after fork().
pub fn dup2_list_resolve_chain(io_chain: &IoChain) -> Dup2List {
    let mut result = Dup2List { actions: vec![] };
    for io in &io_chain.0 {
        if io.source_fd() < 0 {
            result.add_close(io.fd())
        } else {
            result.add_dup2(io.source_fd(), io.fd())
        }
    }
    result
}

impl Dup2List {
    pub fn new() -> Self {
        Default::default()
    }
    /// Return the list of dup2 actions.
    pub fn get_actions(&self) -> &[Dup2Action] {
        &self.actions
    }

    /// Return whether any action dups an fd onto itself. Those need their CLOEXEC bit cleared,
    /// which posix_spawn cannot express.
    pub fn has_self_dup(&self) -> bool {
        self.actions.iter().any(|act| act.src == act.target)
    }

    /// Return whether `fd` is the target of a dup2 in this list.
    pub fn is_target(&self, fd: RawFd) -> bool {
        self.actions.iter().any(|act| act.target == fd)
    }

    /// Append a dup2 action.
    pub fn add_dup2(&mut self, src: RawFd, target: RawFd) {
        assert!(src >= 0 && target >= 0, "Invalid fd in add_dup2");
        // Note: record these even if src and target is the same.
        // This is a note that we must clear the CLO_EXEC bit.
        self.actions.push(Dup2Action { src, target });
    }

    /// Append a close action.
    pub fn add_close(&mut self, fd: RawFd) {
        assert!(fd >= 0, "Invalid fd in add_close");
        self.actions.push(Dup2Action {
            src: fd,
            target: -1,
        })
    }
}
