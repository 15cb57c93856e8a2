use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::Error;

/// Fixed set of reusable transfer buffers.
///
/// Every command the async connector serializes holds one buffer until its bytes are
/// written, so the number of buffers bounds how many commands are in flight on the
/// write side. Acquiring waits while all of them are lent out.
pub(crate) struct BufferPool {
    semaphore: Arc<Semaphore>,
    buffers: Arc<Mutex<Vec<BytesMut>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub(crate) fn new(buffer_size: usize, count: usize) -> Self {
        let buffers = (0..count)
            .map(|_| BytesMut::with_capacity(buffer_size))
            .collect();

        Self {
            semaphore: Arc::new(Semaphore::new(count)),
            buffers: Arc::new(Mutex::new(buffers)),
            buffer_size,
        }
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Waits for a free buffer. Fails with [`Error::ConnectionClosed`] once the pool is
    /// closed.
    pub(crate) async fn acquire(&self) -> Result<PooledBuffer, Error> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let mut buffer = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        buffer.clear();

        Ok(PooledBuffer {
            buffer,
            buffers: self.buffers.clone(),
            _permit: permit,
        })
    }

    /// Wakes every waiter with an error; buffers already lent out still come back.
    pub(crate) fn close(&self) {
        self.semaphore.close();
    }

    pub(crate) fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// A lent transfer buffer. Dropping it hands the buffer and its permit back.
pub(crate) struct PooledBuffer {
    buffer: BytesMut,
    buffers: Arc<Mutex<Vec<BytesMut>>>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buffer = mem::take(&mut self.buffer);
        buffer.clear();
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buffer);
    }
}
