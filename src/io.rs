use crate::fds::{dup_high, BorrowedFdFile};
use crate::flog::FLOG;
use crate::shell::Shell;
use libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Describes what type of IO operation an IoData represents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoMode {
    file,
    pipe,
    fd,
    close,
}

/// Represents a FD redirection.
pub trait IoData: Send + Sync {
    /// Type of redirect.
    fn io_mode(&self) -> IoMode;
    /// FD to redirect.
    fn fd(&self) -> RawFd;
    /// Source fd. This is dup2'd to fd, or if it is -1, then fd is closed.
    /// That is, we call dup2(source_fd, fd).
    fn source_fd(&self) -> RawFd;
}

impl fmt::Debug for dyn IoData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.io_mode() {
            IoMode::close => write!(f, "close {}", self.fd()),
            mode => write!(f, "{:?} {} -> {}", mode, self.source_fd(), self.fd()),
        }
    }
}

pub struct IoClose {
    fd: RawFd,
}
impl IoClose {
    pub fn new(fd: RawFd) -> Self {
        IoClose { fd }
    }
}
impl IoData for IoClose {
    fn io_mode(&self) -> IoMode {
        IoMode::close
    }
    fn fd(&self) -> RawFd {
        self.fd
    }
    fn source_fd(&self) -> RawFd {
        -1
    }
}

pub struct IoFd {
    fd: RawFd,
    source_fd: RawFd,
}
impl IoFd {
    /// fd to redirect specified fd to. For example, for stderr-to-stdout, source_fd is 1, and
    /// fd is 2.
    pub fn new(fd: RawFd, source_fd: RawFd) -> Self {
        IoFd { fd, source_fd }
    }
}
impl IoData for IoFd {
    fn io_mode(&self) -> IoMode {
        IoMode::fd
    }
    fn fd(&self) -> RawFd {
        self.fd
    }
    fn source_fd(&self) -> RawFd {
        self.source_fd
    }
}

/// Represents a redirection to or from an opened file.
/// The file is our own duplicate, so the caller's handle may be closed independently.
pub struct IoFile {
    fd: RawFd,
    // The file which we are writing to or reading from.
    file: File,
}
impl IoFile {
    pub fn new(fd: RawFd, file: File) -> Self {
        IoFile { fd, file }
    }

    /// Redirect `fd` to a duplicate of the caller's descriptor, moved out of the user range.
    pub fn dup_of(fd: RawFd, source: impl AsFd) -> io::Result<Self> {
        let file = File::from(dup_high(source)?);
        Ok(IoFile { fd, file })
    }
}
impl IoData for IoFile {
    fn io_mode(&self) -> IoMode {
        IoMode::file
    }
    fn fd(&self) -> RawFd {
        self.fd
    }
    fn source_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Represents (one end) of a pipe.
pub struct IoPipe {
    fd: RawFd,
    // The pipe's fd. Conceptually this is dup2'd to IoData::fd.
    pipe_fd: OwnedFd,
}
impl IoPipe {
    pub fn new(fd: RawFd, pipe_fd: OwnedFd) -> Self {
        IoPipe { fd, pipe_fd }
    }
}
impl IoData for IoPipe {
    fn io_mode(&self) -> IoMode {
        IoMode::pipe
    }
    fn fd(&self) -> RawFd {
        self.fd
    }
    fn source_fd(&self) -> RawFd {
        self.pipe_fd.as_raw_fd()
    }
}

pub type IoDataRef = Arc<dyn IoData>;

#[derive(Clone, Default)]
pub struct IoChain(pub Vec<IoDataRef>);

impl IoChain {
    pub fn new() -> Self {
        Default::default()
    }
    pub fn push(&mut self, element: IoDataRef) {
        self.0.push(element);
    }
    pub fn pop(&mut self) -> Option<IoDataRef> {
        self.0.pop()
    }
    pub fn append(&mut self, chain: &IoChain) {
        self.0.extend_from_slice(&chain.0);
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return the last io redirection in the chain for the specified file descriptor, or None
    /// if none.
    pub fn io_for_fd(&self, fd: RawFd) -> Option<IoDataRef> {
        self.0.iter().rev().find(|data| data.fd() == fd).cloned()
    }

    /// Return the fd that `fd` is ultimately backed by, following fd-to-fd redirections.
    /// Returns None if `fd` is closed.
    pub fn resolve_fd(&self, fd: RawFd) -> Option<RawFd> {
        let mut cursor = fd;
        let mut end = self.0.len();
        // Walk backwards; an IoFd only refers to what its source meant before it was pushed.
        while let Some(pos) = self.0[..end].iter().rposition(|io| io.fd() == cursor) {
            let io = &self.0[pos];
            match io.io_mode() {
                IoMode::close => return None,
                IoMode::fd => {
                    cursor = io.source_fd();
                    end = pos;
                }
                IoMode::file | IoMode::pipe => return Some(io.source_fd()),
            }
        }
        Some(cursor)
    }
}

impl Extend<IoDataRef> for IoChain {
    fn extend<T: IntoIterator<Item = IoDataRef>>(&mut self, iter: T) {
        self.0.extend(iter)
    }
}

impl fmt::Debug for IoChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

/// The standard input seen by a callable. Reads are buffered; a closed stdin reads as empty.
pub enum InputStream {
    Fd(BufReader<BorrowedFdFile>),
    Closed,
}

impl InputStream {
    fn for_fd(fd: Option<RawFd>) -> Self {
        match fd {
            // Safety: the fd is kept open by the IoChain held alongside this stream.
            Some(fd) => InputStream::Fd(BufReader::new(unsafe { BorrowedFdFile::from_raw_fd(fd) })),
            None => InputStream::Closed,
        }
    }

    /// Read all remaining input as a (lossily decoded) string.
    pub fn read_all(&mut self) -> io::Result<String> {
        let mut bytes = Vec::new();
        self.read_to_end(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl Read for InputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            InputStream::Fd(reader) => reader.read(buf),
            InputStream::Closed => Ok(0),
        }
    }
}

impl BufRead for InputStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match self {
            InputStream::Fd(reader) => reader.fill_buf(),
            InputStream::Closed => Ok(&[]),
        }
    }
    fn consume(&mut self, amt: usize) {
        if let InputStream::Fd(reader) = self {
            reader.consume(amt)
        }
    }
}

/// An output stream seen by a callable. Writes go straight to the fd; a closed stream swallows
/// output.
pub enum OutputStream {
    Fd(BorrowedFdFile),
    Null,
}

impl OutputStream {
    fn for_fd(fd: Option<RawFd>) -> Self {
        match fd {
            // Safety: the fd is kept open by the IoChain held alongside this stream.
            Some(fd) => OutputStream::Fd(unsafe { BorrowedFdFile::from_raw_fd(fd) }),
            None => OutputStream::Null,
        }
    }
}

impl Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputStream::Fd(file) => file.write(buf),
            OutputStream::Null => Ok(buf.len()),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputStream::Fd(file) => file.flush(),
            OutputStream::Null => Ok(()),
        }
    }
}

/// The streams given to a callable, resolved from the redirections in effect when it starts.
pub struct IoStreams<'a> {
    pub stdin: InputStream,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    shell: &'a Shell,
    // Keeps every fd the streams borrow alive.
    _ios: IoChain,
}

impl<'a> IoStreams<'a> {
    pub fn new(shell: &'a Shell) -> Self {
        let ios = shell.materialize();
        FLOG!(redirect, "streams for callable:", format!("{:?}", ios));
        IoStreams {
            stdin: InputStream::for_fd(ios.resolve_fd(STDIN_FILENO)),
            stdout: OutputStream::for_fd(ios.resolve_fd(STDOUT_FILENO)),
            stderr: OutputStream::for_fd(ios.resolve_fd(STDERR_FILENO)),
            shell,
            _ios: ios,
        }
    }

    /// The context the callable runs in. Commands started through it inherit the callable's
    /// redirections.
    pub fn shell(&self) -> &'a Shell {
        self.shell
    }

    /// Copy stdin to stdout line by line, passing each line (without its terminator) through
    /// `f`. Lines for which `f` returns None are dropped. Returns the number of lines written.
    pub fn filter_lines<F>(&mut self, mut f: F) -> io::Result<usize>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut written = 0;
        let mut line = String::new();
        loop {
            line.clear();
            if self.stdin.read_line(&mut line)? == 0 {
                break;
            }
            let content = line.strip_suffix('\n').unwrap_or(&line);
            if let Some(mut out) = f(content) {
                out.push('\n');
                self.stdout.write_all(out.as_bytes())?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Copy stdin to stdout character by character, passing each through `f`.
    /// Characters for which `f` returns None are dropped. Returns the number of chars written.
    pub fn filter_chars<F>(&mut self, mut f: F) -> io::Result<usize>
    where
        F: FnMut(char) -> Option<char>,
    {
        let input = self.stdin.read_all()?;
        let mut out = String::with_capacity(input.len());
        let mut written = 0;
        for c in input.chars().filter_map(&mut f) {
            out.push(c);
            written += 1;
        }
        self.stdout.write_all(out.as_bytes())?;
        Ok(written)
    }
}
