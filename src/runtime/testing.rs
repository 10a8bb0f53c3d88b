//! In-memory stream for driving endpoints and roles in tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;

use super::endpoint::Transport;

/// One scripted outcome of a `read` call.
#[derive(Debug)]
pub enum ReadStep {
    Data(Vec<u8>),
    Eof,
}

/// Shared state behind a `ScriptedStream`.
#[derive(Debug, Default)]
pub struct Script {
    /// Pending reads; an empty queue reads as `WouldBlock`.
    pub reads: VecDeque<ReadStep>,
    /// Everything written so far.
    pub written: Vec<u8>,
    /// Maximum bytes accepted per `write`.
    pub write_limit: Option<usize>,
    /// Every `write` returns `WouldBlock`.
    pub block_writes: bool,
    pub fail_close: bool,
    pub close_calls: usize,
    /// Reported once by `take_error`.
    pub pending_error: Option<io::ErrorKind>,
}

impl Script {
    pub fn push_read(&mut self, data: &[u8]) {
        self.reads.push_back(ReadStep::Data(data.to_vec()));
    }

    pub fn push_eof(&mut self) {
        self.reads.push_back(ReadStep::Eof);
    }
}

/// Non-blocking stream whose behaviour is set through a shared `Script`.
#[derive(Debug)]
pub struct ScriptedStream {
    script: Rc<RefCell<Script>>,
}

impl ScriptedStream {
    pub fn new() -> (Self, Rc<RefCell<Script>>) {
        let script = Rc::new(RefCell::new(Script::default()));
        (
            Self {
                script: Rc::clone(&script),
            },
            script,
        )
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut script = self.script.borrow_mut();
        match script.reads.pop_front() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(ReadStep::Eof) => Ok(0),
            Some(ReadStep::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    script.reads.push_front(ReadStep::Data(data.split_off(n)));
                }
                Ok(n)
            }
        }
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut script = self.script.borrow_mut();
        if script.block_writes {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = script.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        script.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for ScriptedStream {
    fn close(&mut self) -> io::Result<()> {
        let mut script = self.script.borrow_mut();
        script.close_calls += 1;
        if script.fail_close {
            return Err(io::Error::other("close failed"));
        }
        Ok(())
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        Ok(self.script.borrow_mut().pending_error.take().map(io::Error::from))
    }
}
