//! The loop-back medium of data-CSAPs.
use std::sync::Arc;
use std::time::Duration;

use super::hub::Queue;
use super::Media;
use crate::error::Result;

/// Frames written to a pipe are read back from it, in order.
///
/// Forwarding actions of other CSAPs write into the pipe of a data-CSAP, a receive operation on
/// the data-CSAP then sees the forwarded payloads.
pub struct Pipe {
    queue: Arc<Queue>,
}

impl Pipe {
    /// An empty pipe.
    pub fn new() -> Self {
        Pipe {
            queue: Arc::new(Queue::new()),
        }
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Pipe::new()
    }
}

impl Media for Pipe {
    fn read(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        Ok(self.queue.pop(timeout))
    }

    fn write(&self, frame: &[u8]) -> Result<()> {
        self.queue.push(frame.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_back_in_order() {
        let pipe = Pipe::new();
        pipe.write(b"one").unwrap();
        pipe.write(b"two").unwrap();
        assert_eq!(pipe.read(Duration::from_millis(1)).unwrap(), Some(b"one".to_vec()));
        assert_eq!(pipe.read(Duration::from_millis(1)).unwrap(), Some(b"two".to_vec()));
        assert_eq!(pipe.read(Duration::from_millis(1)).unwrap(), None);
    }
}
