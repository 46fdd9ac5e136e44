//! Module `thread` implement a managed worker-thread pattern.
//!
//! It is inspired from the gen-server model from Erlang, where by, every
//! thread is expected to hold onto its own state, reduced here to the
//! half the storage needs: a periodic worker. The main loop sleeps on
//! its [Rx] channel with a timeout, so the same wait serves as timer
//! tick and as shutdown signal. Nothing is ever sent on the channel; it
//! disconnects when the owning [Thread] handle is joined or dropped,
//! and the main loop treats the disconnect as its signal to exit.

use std::{mem, sync::mpsc, thread};

use crate::{err_at, Error, Result};

/// Timer/shutdown channel passed to a thread's main loop.
/// `recv_timeout` on it is an interruptible sleep: it returns `Timeout`
/// on an ordinary tick and `Disconnected` once the owning [Thread] goes
/// away.
pub type Rx = mpsc::Receiver<()>;

/// Thread type, owning a worker thread and its shutdown channel.
///
/// NOTE: When a thread value is dropped, it is made sure that there are
/// no dangling thread routines. To achieve this the thread's main loop
/// must handle the _disconnect_ signal on its [Rx] channel.
pub struct Thread<T = ()> {
    inner: Option<Inner<T>>,
}

struct Inner<T> {
    handle: thread::JoinHandle<T>,
    tx: mpsc::Sender<()>,
}

impl<T> Inner<T> {
    fn join(self) -> Result<T> {
        // disconnect the channel, waking the main loop out of its sleep.
        mem::drop(self.tx);

        match self.handle.join() {
            Ok(val) => Ok(val),
            Err(err) => err_at!(ThreadFail, msg: "fail {:?}", err),
        }
    }
}

impl<T> Drop for Thread<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.join().ok();
        }
    }
}

impl<T> Thread<T> {
    /// Spawn a named worker thread. `main_loop` shall be called with the
    /// rx side of the shutdown channel and shall return a function that
    /// can be spawned using thread::spawn.
    pub fn new<F, N>(name: &str, main_loop: F) -> Result<Thread<T>>
    where
        F: 'static + FnOnce(Rx) -> N + Send,
        N: 'static + Send + FnOnce() -> T,
        T: 'static + Send,
    {
        let (tx, rx) = mpsc::channel();
        let handle = err_at!(
            ThreadFail,
            thread::Builder::new()
                .name(name.to_string())
                .spawn(main_loop(rx))
        )?;

        Ok(Thread {
            inner: Some(Inner { handle, tx }),
        })
    }

    /// Recommended way to exit/shutdown the thread.
    ///
    /// Even otherwise, when Thread value goes out of scope its drop
    /// implementation shall call this method to exit the thread, except
    /// that any errors are ignored.
    pub fn join(mut self) -> Result<T> {
        self.inner.take().unwrap().join()
    }
}

#[cfg(test)]
#[path = "thread_test.rs"]
mod thread_test;
