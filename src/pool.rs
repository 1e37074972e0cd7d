// Benji backup system.

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.

//! A bounded worker pool used by the backup, restore, scrub, and cleanup
//! pipelines.
//!
//! Work items are sent through a bounded crossbeam channel, so a producer
//! naturally blocks when all workers are busy and the queue is full. The
//! first error raised by any worker is captured; later sends fail fast and
//! `complete()` surfaces it after joining all threads.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};

use crate::errors::Error;
use crate::Result;

struct Abort {
    error: Option<Error>,
    failed: bool,
}

/// Cloneable handle for sending work into the pool.
pub struct SendHandle<I> {
    input: Sender<I>,
    abort: Arc<Mutex<Abort>>,
}

impl<I> Clone for SendHandle<I> {
    fn clone(&self) -> Self {
        SendHandle {
            input: self.input.clone(),
            abort: self.abort.clone(),
        }
    }
}

impl<I: Send + 'static> SendHandle<I> {
    /// Returns the first error a worker raised, if any. The error itself is
    /// surfaced only once; subsequent calls report a generic failure.
    pub fn check_abort(&self) -> Result<()> {
        let mut guard = self.abort.lock().unwrap();
        if let Some(error) = guard.error.take() {
            return Err(error);
        }
        if guard.failed {
            return Err(Error::internal("worker pool already failed"));
        }
        Ok(())
    }

    /// Send one work item, blocking while the queue is full.
    pub fn send(&self, input: I) -> Result<()> {
        self.check_abort()?;
        self.input
            .send(input)
            .map_err(|_| Error::internal("worker pool channel closed"))
    }
}

pub struct ParallelHandler<I> {
    handles: Vec<JoinHandle<()>>,
    name: String,
    input: SendHandle<I>,
}

impl<I: Send + 'static> ParallelHandler<I> {
    /// Start `threads` workers, each applying `handler_fn` to incoming items.
    /// The input queue holds at most `queue_depth` pending items.
    pub fn new<F>(name: &str, threads: usize, queue_depth: usize, handler_fn: F) -> Self
    where
        F: Fn(I) -> Result<()> + Send + Sync + Clone + 'static,
    {
        let (input_tx, input_rx) = bounded::<I>(queue_depth.max(1));
        let abort = Arc::new(Mutex::new(Abort {
            error: None,
            failed: false,
        }));

        let mut handles = Vec::new();
        for i in 0..threads.max(1) {
            let input_rx = input_rx.clone();
            let abort = abort.clone();
            let handler_fn = handler_fn.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("{} ({})", name, i))
                    .spawn(move || loop {
                        let data = match input_rx.recv() {
                            Ok(data) => data,
                            Err(_) => return,
                        };
                        if let Err(err) = handler_fn(data) {
                            let mut guard = abort.lock().unwrap();
                            if !guard.failed {
                                guard.error = Some(err);
                                guard.failed = true;
                            }
                        }
                    })
                    .expect("spawn worker thread"),
            );
        }
        Self {
            handles,
            name: name.to_owned(),
            input: SendHandle {
                input: input_tx,
                abort,
            },
        }
    }

    pub fn channel(&self) -> SendHandle<I> {
        self.input.clone()
    }

    pub fn send(&self, input: I) -> Result<()> {
        self.input.send(input)
    }

    /// Close the input channel, join all workers, and surface the first
    /// error raised by any of them.
    pub fn complete(self) -> Result<()> {
        let abort = self.input.abort.clone();
        drop(self.input);
        let mut panics = Vec::new();
        for (i, handle) in self.handles.into_iter().enumerate() {
            if handle.join().is_err() {
                panics.push(format!("thread {} ({}) panicked", self.name, i));
            }
        }
        if !panics.is_empty() {
            return Err(Error::internal(panics.join("; ")));
        }
        let mut guard = abort.lock().unwrap();
        if let Some(error) = guard.error.take() {
            return Err(error);
        }
        if guard.failed {
            return Err(Error::internal("worker pool already failed"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn processes_all_items() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let pool = ParallelHandler::new("test", 4, 4, move |n: usize| {
            count2.fetch_add(n, Ordering::Relaxed);
            Ok(())
        });
        for i in 0..100 {
            pool.send(i).unwrap();
        }
        pool.complete().unwrap();
        assert_eq!(count.load(Ordering::Relaxed), (0..100).sum::<usize>());
    }

    #[test]
    fn surfaces_first_error() {
        let pool = ParallelHandler::new("test", 2, 2, |n: usize| {
            if n == 3 {
                Err(Error::internal("boom"))
            } else {
                Ok(())
            }
        });
        for i in 0..10 {
            // Sends may start failing once the error is recorded.
            if pool.send(i).is_err() {
                break;
            }
        }
        assert!(pool.complete().is_err());
    }
}
