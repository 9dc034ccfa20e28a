use std::sync::Mutex;
use tracing::trace;

/// Recycles payload buffers so the receive and send hot paths do not allocate per datagram.
///
/// The worker pulls a buffer for every parsed incoming message; the application returns it
///  through `Peer::recycle` once it is done with the message. Buffers in excess of the pool
///  limit are simply dropped.
pub(crate) struct MessagePool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl MessagePool {
    pub fn new(max_pooled: usize) -> MessagePool {
        MessagePool {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
        }
    }

    pub fn get_buffer(&self, capacity_hint: usize) -> Vec<u8> {
        if let Some(mut buf) = self.buffers.lock().unwrap().pop() {
            trace!("reusing pooled buffer");
            buf.reserve(capacity_hint);
            return buf;
        }
        Vec::with_capacity(capacity_hint)
    }

    pub fn return_buffer(&self, mut buffer: Vec<u8>) {
        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_pooled {
            buffers.push(buffer);
        } else {
            trace!("pool is full: discarding returned buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returned_buffer_is_cleared_and_reused() {
        let pool = MessagePool::new(4);

        let mut buf = pool.get_buffer(16);
        buf.extend_from_slice(&[1, 2, 3]);
        let ptr = buf.as_ptr();
        pool.return_buffer(buf);

        let buf = pool.get_buffer(8);
        assert!(buf.is_empty());
        assert_eq!(buf.as_ptr(), ptr);
    }

    #[test]
    fn test_pool_limit() {
        let pool = MessagePool::new(1);
        pool.return_buffer(Vec::with_capacity(8));
        pool.return_buffer(Vec::with_capacity(8));

        assert_eq!(pool.buffers.lock().unwrap().len(), 1);
    }
}
